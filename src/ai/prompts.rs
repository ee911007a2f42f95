use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::findings::Finding;

use super::{FixOutcome, FixRequest, FixSummary, PrText, TriageOutcome};

const DEFAULT_TRIAGE: &str = include_str!("default_prompts/triage.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix.md");
const DEFAULT_PR_DESCRIPTION: &str = include_str!("default_prompts/pr-description.md");

pub const SYSTEM_TRIAGE: &str = "You are the triage engine of an autonomous security \
remediation agent. You rank scanner findings by real-world exploitability and fix value. \
You respond with a single JSON object and nothing else.";

pub const SYSTEM_FIX: &str = "You are the patch engine of an autonomous security remediation \
agent. You produce minimal, correct fixes as strict unified diffs. You respond with a single \
JSON object and nothing else.";

pub const SYSTEM_PR: &str = "You write concise pull-request descriptions for automated \
security fixes. You respond with a single JSON object and nothing else.";

fn default_template(phase: &str) -> Option<&'static str> {
    match phase {
        "triage" => Some(DEFAULT_TRIAGE),
        "fix" => Some(DEFAULT_FIX),
        "pr-description" => Some(DEFAULT_PR_DESCRIPTION),
        _ => None,
    }
}

/// Prompt template engine with embedded defaults and per-phase user
/// overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    pub fn load_template(&self, phase: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(format!("{phase}.md"));
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                })?;
                return Ok(content);
            }
        }

        default_template(phase)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt phase: {phase}")))
    }

    pub fn render_phase(&self, phase: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(phase)?;
        render_template(&template, vars)
    }
}

/// Render a template string using the `upon` template engine.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}

/// Builds the per-operation prompts. The optional profile addendum rides on
/// the system prompt.
pub struct PromptRunner {
    engine: PromptEngine,
    profile: Option<String>,
}

impl PromptRunner {
    pub fn new(profile: Option<String>) -> Self {
        Self {
            engine: PromptEngine::new(None),
            profile,
        }
    }

    pub fn system(&self, base: &str) -> String {
        match &self.profile {
            Some(profile) if !profile.is_empty() => format!("{base}\n\n{profile}"),
            _ => base.to_string(),
        }
    }

    pub fn triage_user_prompt(&self, findings: &[Finding]) -> Result<String> {
        let findings_json = serde_json::to_string_pretty(findings)
            .map_err(|e| Error::Prompt(format!("failed to serialize findings: {e}")))?;
        let mut vars = HashMap::new();
        vars.insert("findings_json".to_string(), findings_json);
        vars.insert("count".to_string(), findings.len().to_string());
        self.engine.render_phase("triage", &vars)
    }

    pub fn fix_user_prompt(&self, req: &FixRequest) -> Result<String> {
        let f = &req.finding;
        let mut vars = HashMap::new();
        vars.insert("repo".to_string(), req.repo_slug.clone());
        vars.insert("finding_id".to_string(), f.id.clone());
        vars.insert("kind".to_string(), f.kind.to_string());
        vars.insert("severity".to_string(), f.severity.label().to_string());
        vars.insert("title".to_string(), f.title.clone());
        vars.insert("message".to_string(), f.message.clone());
        vars.insert("file_path".to_string(), f.file_path.clone());
        vars.insert("line".to_string(), f.line.to_string());
        vars.insert("package".to_string(), f.package.clone());
        vars.insert("package_version".to_string(), f.package_version.clone());
        vars.insert("fix_version".to_string(), f.fix_version.clone());
        vars.insert("file_context".to_string(), req.file_context.clone());
        self.engine.render_phase("fix", &vars)
    }

    pub fn pr_user_prompt(&self, fixes: &[FixSummary]) -> Result<String> {
        let fixes_block = fixes
            .iter()
            .map(|f| {
                format!(
                    "- {} (`{}`): {}",
                    f.finding_title, f.file_path, f.explanation
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut vars = HashMap::new();
        vars.insert("fixes_block".to_string(), fixes_block);
        vars.insert("count".to_string(), fixes.len().to_string());
        self.engine.render_phase("pr-description", &vars)
    }
}

/// Strip markdown code fences (```json ... ```) models sometimes wrap
/// output in.
pub fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the optional language tag on the opening fence line
        let after_tag = if let Some(pos) = rest.find('\n') {
            &rest[pos + 1..]
        } else {
            return String::new();
        };

        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }

    trimmed.to_string()
}

/// Cut the response down to the outermost JSON object when the model added
/// prose around it.
fn extract_json_object(input: &str) -> &str {
    let start = input.find('{');
    let end = input.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => &input[s..=e],
        _ => input,
    }
}

pub fn parse_triage_response(raw: &str) -> std::result::Result<TriageOutcome, String> {
    let cleaned = strip_markdown_fences(raw);
    serde_json::from_str(extract_json_object(&cleaned))
        .map_err(|e| format!("triage response is not valid JSON: {e}"))
}

pub fn parse_fix_response(raw: &str) -> std::result::Result<FixOutcome, String> {
    let cleaned = strip_markdown_fences(raw);
    let mut outcome: FixOutcome = serde_json::from_str(extract_json_object(&cleaned))
        .map_err(|e| format!("fix response is not valid JSON: {e}"))?;
    outcome.confidence = outcome.confidence.clamp(0.0, 1.0);
    Ok(outcome)
}

pub fn parse_pr_response(raw: &str) -> std::result::Result<PrText, String> {
    let cleaned = strip_markdown_fences(raw);
    let text: PrText = serde_json::from_str(extract_json_object(&cleaned))
        .map_err(|e| format!("pr response is not valid JSON: {e}"))?;
    if text.title.is_empty() {
        return Err("pr response has an empty title".to_string());
    }
    Ok(text)
}
