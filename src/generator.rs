//! Metadata generation collaborator.
//!
//! A generator turns the text of a content file into an untyped YAML
//! document. The document is not trusted: callers validate it with
//! [`crate::sidecar::metadata_from_value`] before anything touches disk.
//!
//! # Providers
//!
//! - **`disabled`**: [`DisabledGenerator`], every call fails. Gated items
//!   that need regeneration are reported as failed and left untouched.
//! - **`anthropic`**: [`AnthropicGenerator`], calls the Messages API with an
//!   analyzer template and extracts the YAML between `<output>` tags.
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network errors are retried with
//! exponential backoff (1s, 2s, 4s, ... capped at 32s) up to
//! `generator.max_retries` times. Other 4xx responses fail immediately.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::config::{Config, GeneratorConfig};
use crate::error::{Result, SyncError};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

const PROMPT_PLACEHOLDER: &str = "{{PROMPT_TO_ANALYZE}}";
const FRAGMENTS_PLACEHOLDER: &str = "{{AVAILABLE_PROMPT_FRAGMENTS}}";

/// Analyzer template used when `generator.analyzer_prompt` is not set.
const DEFAULT_ANALYZER: &str = r#"You are cataloguing a library of reusable AI prompts.

Analyze the prompt below and describe it as a YAML document with these keys:
title, primary_category, subcategories (list), directory (a short
kebab-case slug), tags (list), one_line_description, description,
variables (list of {name, role, optional_for_user}) and, when the prompt
uses any of the available fragments, fragments (list of
{name, category, variable}).

Available fragments, by category:
{{AVAILABLE_PROMPT_FRAGMENTS}}

<prompt>
{{PROMPT_TO_ANALYZE}}
</prompt>

Answer with the YAML document only, wrapped in <output></output> tags."#;

/// Produces metadata for a content file.
#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    async fn generate(&self, content: &str) -> Result<serde_yaml::Value>;
}

/// Build the generator named by `generator.provider`.
pub fn create_generator(config: &Config) -> anyhow::Result<Arc<dyn MetadataGenerator>> {
    match config.generator.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "anthropic" => Ok(Arc::new(AnthropicGenerator::new(
            &config.generator,
            config.library.fragments_dir(),
        )?)),
        other => bail!("Unknown generator provider: {}", other),
    }
}

// ============ Disabled Generator ============

pub struct DisabledGenerator;

#[async_trait]
impl MetadataGenerator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _content: &str) -> Result<serde_yaml::Value> {
        Err(SyncError::Generation(
            "metadata generator is disabled (set generator.provider)".to_string(),
        ))
    }
}

// ============ Anthropic Generator ============

pub struct AnthropicGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
    template: String,
    fragments_dir: PathBuf,
}

impl AnthropicGenerator {
    /// Requires `ANTHROPIC_API_KEY` in the environment and a readable
    /// analyzer template when one is configured.
    pub fn new(config: &GeneratorConfig, fragments_dir: PathBuf) -> anyhow::Result<Self> {
        let api_key = match std::env::var("ANTHROPIC_API_KEY") {
            Ok(k) if !k.is_empty() => k,
            _ => bail!("ANTHROPIC_API_KEY environment variable not set"),
        };

        let template = match &config.analyzer_prompt {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("reading analyzer prompt {}: {}", path.display(), e)
            })?,
            None => DEFAULT_ANALYZER.to_string(),
        };
        tracing::debug!(chars = template.len(), "analyzer prompt loaded");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            template,
            fragments_dir,
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying generation request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(MESSAGES_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| SyncError::Generation(e.to_string()))?;
                        return parse_messages_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = SyncError::Generation(format!(
                        "Anthropic API error {}: {}",
                        status, body_text
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "transient generation failure");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "generation request failed");
                    last_err = Some(SyncError::Generation(e.to_string()));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| SyncError::Generation("generation failed after retries".into())))
    }
}

#[async_trait]
impl MetadataGenerator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, content: &str) -> Result<serde_yaml::Value> {
        let fragments = list_fragments(&self.fragments_dir);
        let prompt = render_template(&self.template, content, &fragments);
        let text = self.complete(&prompt).await?;
        parse_output(&text)
    }
}

/// Concatenate the text blocks of a Messages API response.
fn parse_messages_response(json: &serde_json::Value) -> Result<String> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| SyncError::Generation("response has no content blocks".into()))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.trim().is_empty() {
        return Err(SyncError::Generation("response contained no text".into()));
    }
    Ok(text)
}

pub fn render_template(template: &str, content: &str, fragments: &str) -> String {
    template
        .replace(FRAGMENTS_PLACEHOLDER, fragments)
        .replace(PROMPT_PLACEHOLDER, content)
}

/// The text between the first `<output>` and the following `</output>`,
/// or the whole trimmed text when the tags are absent.
pub fn extract_output(text: &str) -> &str {
    const OPEN: &str = "<output>";
    const CLOSE: &str = "</output>";
    if let Some(start) = text.find(OPEN) {
        let inner = &text[start + OPEN.len()..];
        if let Some(end) = inner.find(CLOSE) {
            return inner[..end].trim();
        }
    }
    tracing::warn!("output tags not found, using whole response");
    text.trim()
}

/// Parse model output into YAML, tolerating a fenced code block.
pub fn parse_output(text: &str) -> Result<serde_yaml::Value> {
    let mut yaml = extract_output(text);
    if let Some(rest) = yaml.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
        yaml = rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    serde_yaml::from_str(yaml).map_err(|e| SyncError::Generation(format!("output is not YAML: {}", e)))
}

/// Fragment names grouped by category directory, as pretty JSON.
pub fn list_fragments(fragments_dir: &Path) -> String {
    let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Ok(categories) = std::fs::read_dir(fragments_dir) else {
        return "{}".to_string();
    };
    for category in categories.flatten() {
        if !category.path().is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(category.path()) else {
            continue;
        };
        let mut names: Vec<String> = files
            .flatten()
            .filter_map(|f| {
                Path::new(&f.file_name())
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        by_category.insert(category.file_name().to_string_lossy().into_owned(), names);
    }
    serde_json::to_string_pretty(&by_category).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn extracts_between_output_tags() {
        let text = "Sure.\n<output>\ntitle: X\n</output>\ntrailing";
        assert_eq!(extract_output(text), "title: X");
    }

    #[test]
    fn missing_tags_returns_trimmed_text() {
        assert_eq!(extract_output("  title: X \n"), "title: X");
        assert_eq!(extract_output("<output>title: X"), "<output>title: X");
    }

    #[test]
    fn parse_output_accepts_fenced_yaml() {
        let text = "<output>\n```yaml\ntitle: X\ntags: [a]\n```\n</output>";
        let value = parse_output(text).unwrap();
        assert_eq!(value["title"].as_str(), Some("X"));
    }

    #[test]
    fn parse_output_rejects_garbage() {
        let err = parse_output("<output>title: [unclosed</output>").unwrap_err();
        assert!(matches!(err, SyncError::Generation(_)));
    }

    #[test]
    fn template_substitutes_placeholders() {
        let out = render_template(
            "F={{AVAILABLE_PROMPT_FRAGMENTS}} P={{PROMPT_TO_ANALYZE}}",
            "body",
            "{}",
        );
        assert_eq!(out, "F={} P=body");
    }

    #[test]
    fn default_template_has_both_placeholders() {
        assert!(DEFAULT_ANALYZER.contains(PROMPT_PLACEHOLDER));
        assert!(DEFAULT_ANALYZER.contains(FRAGMENTS_PLACEHOLDER));
    }

    #[test]
    fn fragments_listed_by_category() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("style")).unwrap();
        std::fs::write(tmp.path().join("style/concise.md"), "x").unwrap();
        std::fs::write(tmp.path().join("style/formal.md"), "x").unwrap();
        std::fs::write(tmp.path().join("README.md"), "x").unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&list_fragments(tmp.path())).unwrap();
        assert_eq!(json, serde_json::json!({ "style": ["concise", "formal"] }));
        assert_eq!(list_fragments(&tmp.path().join("missing")), "{}");
    }

    #[test]
    fn messages_response_joins_text_blocks() {
        let json = serde_json::json!({
            "content": [
                { "type": "text", "text": "<output>" },
                { "type": "text", "text": "title: X</output>" }
            ]
        });
        assert_eq!(parse_messages_response(&json).unwrap(), "<output>title: X</output>");
        assert!(parse_messages_response(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn disabled_generator_fails() {
        let err = DisabledGenerator.generate("x").await.unwrap_err();
        assert!(err.is_item_local());
    }
}
