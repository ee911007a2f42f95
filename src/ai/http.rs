use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};

use super::AiError;

/// In-provider attempts for a rate-limited call.
const MAX_ATTEMPTS: u32 = 6;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Thin JSON-over-HTTP client shared by the chat providers. Handles the
/// rate-limit retry policy; everything else surfaces as a classified
/// `AiError` for the chain to act on.
pub struct HttpChat {
    client: reqwest::Client,
    provider: String,
}

impl HttpChat {
    pub fn new(provider: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Ai(AiError::Connect {
                provider: provider.to_string(),
                message: e.to_string(),
            }))?;
        Ok(Self {
            client,
            provider: provider.to_string(),
        })
    }

    pub async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => return Err(self.map_transport_error(e)),
            };

            let status = response.status().as_u16();
            if status == 429 {
                let retry_after = parse_retry_after(&response);
                let text = response.text().await.unwrap_or_default();
                if attempt == MAX_ATTEMPTS {
                    return Err(Error::Ai(AiError::RateLimited {
                        provider: self.provider.clone(),
                        message: snippet(&text),
                    }));
                }
                let delay = retry_after
                    .or_else(|| parse_retry_phrase(&text))
                    .unwrap_or(backoff.min(MAX_BACKOFF));
                warn!(
                    provider = %self.provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            if status == 401 || status == 403 {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::Ai(AiError::Auth {
                    provider: self.provider.clone(),
                    message: format!("HTTP {status}: {}", snippet(&text)),
                }));
            }
            if status >= 500 {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::Ai(AiError::Server {
                    provider: self.provider.clone(),
                    message: format!("HTTP {status}: {}", snippet(&text)),
                }));
            }
            if status >= 400 {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::Ai(AiError::Client {
                    provider: self.provider.clone(),
                    message: format!("HTTP {status}: {}", snippet(&text)),
                }));
            }

            return response.json().await.map_err(|e| {
                Error::Ai(AiError::InvalidResponse {
                    provider: self.provider.clone(),
                    message: e.to_string(),
                })
            });
        }
        unreachable!()
    }

    fn map_transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Ai(AiError::Timeout {
                provider: self.provider.clone(),
            })
        } else {
            Error::Ai(AiError::Connect {
                provider: self.provider.clone(),
                message: e.to_string(),
            })
        }
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(300).collect()
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parse "please try again in 3s" / "try again in 750ms" phrases some
/// backends put in the 429 body.
pub(crate) fn parse_retry_phrase(body: &str) -> Option<Duration> {
    let re = Regex::new(r"(?i)try again in\s+(\d+)\s*(ms|s)").ok()?;
    let caps = re.captures(body)?;
    let amount: u64 = caps[1].parse().ok()?;
    match &caps[2].to_lowercase()[..] {
        "ms" => Some(Duration::from_millis(amount)),
        _ => Some(Duration::from_secs(amount)),
    }
}
