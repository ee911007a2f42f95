use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::findings::Finding;

use super::breaker::CircuitBreaker;
use super::{
    AiError, AiProvider, FixOutcome, FixRequest, FixSummary, PrText, ProviderInfo, TriageOutcome,
};

/// Failover chain over an ordered list of providers.
///
/// Each call walks the list in order, skipping providers whose circuit is
/// open. Retriable errors fail over to the next provider; auth errors trip
/// the circuit immediately and fail over; other client errors end the walk
/// and go back to the caller.
pub struct ProviderChain {
    providers: Vec<Arc<dyn AiProvider>>,
    breakers: Vec<CircuitBreaker>,
    current: AtomicUsize,
    fallback_active: AtomicBool,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn AiProvider>>) -> Self {
        let breakers = providers.iter().map(|_| CircuitBreaker::default()).collect();
        Self {
            providers,
            breakers,
            current: AtomicUsize::new(0),
            fallback_active: AtomicBool::new(false),
        }
    }

    /// Name of the provider that served the last successful call, and
    /// whether the chain is past its primary.
    pub fn current_provider(&self) -> (String, bool) {
        let index = self.current.load(Ordering::SeqCst).min(self.providers.len() - 1);
        (
            self.providers[index].name().to_string(),
            self.fallback_active.load(Ordering::SeqCst),
        )
    }

    fn record_outcome(&self, index: usize, success: bool) {
        if success {
            self.breakers[index].record_success();
            self.current.store(index, Ordering::SeqCst);
            self.fallback_active.store(index > 0, Ordering::SeqCst);
        } else {
            self.breakers[index].record_failure();
        }
    }

    async fn call<'a, T, F>(&'a self, op: &str, f: F) -> Result<T>
    where
        F: Fn(
            Arc<dyn AiProvider>,
        ) -> std::pin::Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    {
        let mut last_error: Option<Error> = None;

        for (index, provider) in self.providers.iter().enumerate() {
            if !self.breakers[index].allow() {
                info!(provider = provider.name(), op, "circuit open, skipping");
                continue;
            }

            match f(Arc::clone(provider)).await {
                Ok(value) => {
                    self.record_outcome(index, true);
                    return Ok(value);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::Ai(e)) if e.is_auth() => {
                    warn!(provider = provider.name(), op, error = %e, "auth failure, tripping circuit");
                    self.breakers[index].record_failure();
                    self.breakers[index].trip();
                    last_error = Some(Error::Ai(e));
                }
                Err(Error::Ai(e)) if e.is_retriable() => {
                    warn!(provider = provider.name(), op, error = %e, "retriable failure, failing over");
                    self.record_outcome(index, false);
                    last_error = Some(Error::Ai(e));
                }
                Err(e) => {
                    // Non-retriable client/parse error: no point walking the
                    // rest of the chain with the same request.
                    self.record_outcome(index, false);
                    return Err(e);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no provider admitted the call".to_string());
        Err(AiError::ChainExhausted { message }.into())
    }

    #[cfg(test)]
    pub(crate) fn breaker(&self, index: usize) -> &CircuitBreaker {
        &self.breakers[index]
    }
}

#[async_trait]
impl AiProvider for ProviderChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn info(&self) -> ProviderInfo {
        let index = self.current.load(Ordering::SeqCst).min(self.providers.len() - 1);
        self.providers[index].info()
    }

    async fn is_available(&self) -> bool {
        for provider in &self.providers {
            if provider.is_available().await {
                return true;
            }
        }
        false
    }

    async fn triage_findings(&self, findings: &[Finding]) -> Result<TriageOutcome> {
        self.call("triage", |p| {
            Box::pin(async move { p.triage_findings(findings).await })
        })
        .await
    }

    async fn generate_fix(&self, req: &FixRequest) -> Result<FixOutcome> {
        self.call("generate_fix", |p| {
            Box::pin(async move { p.generate_fix(req).await })
        })
        .await
    }

    async fn generate_pr_description(&self, fixes: &[FixSummary]) -> Result<PrText> {
        self.call("pr_description", |p| {
            Box::pin(async move { p.generate_pr_description(fixes).await })
        })
        .await
    }
}
