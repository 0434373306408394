//! C9 — AutoFix Flow.
//!
//! Parses an error log, retrieves code and prose context from two external
//! collaborators, asks an AI collaborator for a suggestion, verifies it in
//! the sandbox, and — when asked to apply — writes the patch and enqueues
//! a fresh deployment. The AI, vector-index and wisdom collaborators are
//! out of scope per the purpose statement; only the trait each is consumed
//! through lives here, with a deterministic mock alongside for local
//! operation and tests.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sandbox::{SandboxProvider, VerifyOutcome};

/// Regex used to extract `(focus_file, line)` from an error log. Generalized
/// from the original's Python-traceback-specific pattern to also match the
/// common non-Python shapes this crate's multi-framework builds can emit.
static FOCUS_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:File "(?P<py_file>[^"]+)", line (?P<py_line>\d+))|(?:at (?P<at_file>[^\s:]+):(?P<at_line>\d+))|(?:(?P<plain_file>[^\s:]+\.[a-zA-Z0-9]+):(?P<plain_line>\d+):)"#).unwrap()
});

pub fn extract_focus(error_log: &str) -> Option<(String, u32)> {
    let caps = FOCUS_FILE_RE.captures(error_log)?;
    for (file_group, line_group) in [
        ("py_file", "py_line"),
        ("at_file", "at_line"),
        ("plain_file", "plain_line"),
    ] {
        if let (Some(file), Some(line)) = (caps.name(file_group), caps.name(line_group)) {
            if let Ok(line_no) = line.as_str().parse() {
                return Some((file.as_str().to_string(), line_no));
            }
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub code_snippets: Vec<CodeSnippet>,
    pub wisdom: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixOutcome {
    pub focus_file: String,
    pub suggestion: String,
    pub verification: VerifyOutcome,
    pub context_retrieved: bool,
}

#[async_trait]
pub trait VectorIndexClient: Send + Sync {
    async fn top_k_snippets(&self, query: &str, project_id: i64) -> Vec<CodeSnippet>;
}

#[async_trait]
pub trait WisdomStore: Send + Sync {
    async fn retrieve(&self, query: &str, project_id: i64) -> Option<String>;
    async fn store_success(&self, project_id: i64, summary: &str);
}

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, String>;
}

/// Deterministic in-process stand-ins for the three out-of-scope
/// collaborators. Returns empty/templated data; real deployments inject
/// HTTP-backed implementations against the AI vendor, vector index, and
/// wisdom store of choice.
pub struct NullCollaborators;

#[async_trait]
impl VectorIndexClient for NullCollaborators {
    async fn top_k_snippets(&self, _query: &str, _project_id: i64) -> Vec<CodeSnippet> {
        Vec::new()
    }
}

#[async_trait]
impl WisdomStore for NullCollaborators {
    async fn retrieve(&self, _query: &str, _project_id: i64) -> Option<String> {
        None
    }

    async fn store_success(&self, _project_id: i64, _summary: &str) {}
}

#[async_trait]
impl AiClient for NullCollaborators {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, String> {
        Err("no AI collaborator configured".to_string())
    }
}

fn build_prompt(error_log: &str, context: &RetrievedContext) -> String {
    let code_context = context
        .code_snippets
        .iter()
        .map(|s| format!("--- File: {} ---\n{}", s.path, s.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let wisdom_context = context
        .wisdom
        .clone()
        .unwrap_or_else(|| "No specific wisdom found for this error.".to_string());

    let tail: String = error_log.chars().rev().take(1000).collect::<Vec<_>>().into_iter().rev().collect();

    format!(
        "ERROR LOG:\n{tail}\n\nCODE CONTEXT:\n{code_context}\n\nPAST WISDOM:\n{wisdom_context}\n\n\
         INSTRUCTIONS:\n1. Analyze the error log against the provided code.\n\
         2. If the fix is obvious, provide the corrected code snippet.\n\
         3. If more info is needed, explain what to check.\n4. Keep it concise."
    )
}

/// Runs the analyze-and-fix flow, stopping short of writing the patch.
pub async fn analyze_and_fix(
    project_id: i64,
    error_log: &str,
    workspace: &str,
    ai: &dyn AiClient,
    index: &dyn VectorIndexClient,
    wisdom: &dyn WisdomStore,
    sandbox: &dyn SandboxProvider,
) -> Result<AutoFixOutcome, String> {
    let focus_file = extract_focus(error_log)
        .map(|(file, _)| file)
        .unwrap_or_else(|| "unknown".to_string());

    let tail: String = error_log.chars().rev().take(500).collect::<Vec<_>>().into_iter().rev().collect();
    let query = format!("Error in {focus_file}: {tail}");

    let snippets = index.top_k_snippets(&query, project_id).await;
    let wisdom_text = wisdom.retrieve(&query, project_id).await;
    let context = RetrievedContext {
        code_snippets: snippets,
        wisdom: wisdom_text,
    };
    let context_retrieved = !context.code_snippets.is_empty();

    let prompt = build_prompt(error_log, &context);
    let suggestion = ai
        .complete(
            "You are an expert debugging agent. Generate a precise fix for the following error.",
            &prompt,
        )
        .await?;

    let verification = sandbox
        .verify(workspace, &focus_file, &suggestion, error_log)
        .await
        .map_err(|e| e.to_string())?;

    Ok(AutoFixOutcome {
        focus_file,
        suggestion,
        verification,
        context_retrieved,
    })
}

/// Strips a markdown code fence from `suggestion`, if present.
fn strip_code_fence(suggestion: &str) -> String {
    let trimmed = suggestion.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_alphanumeric());
        let rest = rest.trim_start_matches('\n');
        rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApplyFixError {
    #[error("patched content is suspiciously short")]
    TooShort,
    #[error("failed to write patched file: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces a full replacement of `file_path`, persists it, records
/// success wisdom, and returns the written content so the caller can
/// enqueue a redeploy.
pub async fn apply_fix(
    file_path: &std::path::Path,
    suggestion: &str,
    project_id: i64,
    wisdom: &dyn WisdomStore,
) -> Result<String, ApplyFixError> {
    let patched = strip_code_fence(suggestion);
    if patched.len() <= 10 {
        return Err(ApplyFixError::TooShort);
    }
    tokio::fs::write(file_path, &patched).await?;
    wisdom
        .store_success(project_id, &format!("applied fix to {}", file_path.display()))
        .await;
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MockSandboxProvider;

    #[test]
    fn extracts_python_style_focus() {
        let log = "Traceback...\n  File \"app/main.py\", line 42, in handler\nKeyError: 'x'";
        let (file, line) = extract_focus(log).unwrap();
        assert_eq!(file, "app/main.py");
        assert_eq!(line, 42);
    }

    #[test]
    fn extracts_js_style_focus() {
        let log = "TypeError: x is not a function\n    at index.js:10:5";
        let (file, _) = extract_focus(log).unwrap();
        assert_eq!(file, "index.js");
    }

    #[test]
    fn returns_none_when_no_match() {
        assert!(extract_focus("segmentation fault").is_none());
    }

    #[test]
    fn strips_fenced_code_block() {
        let fenced = "```python\nprint('hi')\n```";
        assert_eq!(strip_code_fence(fenced), "print('hi')");
    }

    #[tokio::test]
    async fn apply_fix_rejects_too_short_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.py");
        let err = apply_fix(&path, "x", 1, &NullCollaborators)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyFixError::TooShort));
    }

    #[tokio::test]
    async fn analyze_and_fix_fails_without_an_ai_collaborator() {
        let sandbox = MockSandboxProvider::new();
        let err = analyze_and_fix(
            1,
            "File \"app.py\", line 1",
            "/ws",
            &NullCollaborators,
            &NullCollaborators,
            &NullCollaborators,
            &sandbox,
        )
        .await
        .unwrap_err();
        assert!(err.contains("no AI collaborator"));
    }
}
