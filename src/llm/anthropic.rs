//! Anthropic-backed collaborators via rig-core.
//!
//! One client serves all three roles. Every call asks for a JSON reply,
//! which is parsed leniently (code fences and surrounding prose are
//! tolerated) and then shape-checked.

use opentelemetry::KeyValue;
use rig::client::CompletionClient;
use rig::completion::{AssistantContent, CompletionModel as _};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug};

use super::{Aligner, RecipeGenerator, RegenerateRequest, Translator, UpstreamError, UpstreamErrorKind};
use crate::error::{Error, Result};
use crate::model::{
    AlignedWord, Mode, Recipe, RecipeBundle, SelfReport, TranslationContext, Variant,
};
use crate::telemetry::{genai, metrics};

const PROVIDER: &str = "anthropic";
const MAX_TOKENS: u64 = 2048;

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> std::result::Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// Translator, aligner and recipe generator backed by one Anthropic model.
pub struct AnthropicCollaborator {
    client: rig::providers::anthropic::Client,
    model: String,
    variants_per_line: usize,
}

impl AnthropicCollaborator {
    pub fn new(api_key: &SecretString, model: impl Into<String>, variants_per_line: usize) -> Result<Self> {
        let client = anthropic_client(api_key)
            .map_err(|e| Error::Config(format!("failed to create Anthropic client: {e}")))?;
        Ok(Self {
            client,
            model: model.into(),
            variants_per_line,
        })
    }

    async fn chat(
        &self,
        task: &str,
        preamble: String,
        prompt: String,
        temperature: f64,
    ) -> std::result::Result<String, UpstreamError> {
        let span = genai::start_chat_span(&self.model, PROVIDER, task);
        let model = self.client.completion_model(self.model.as_str());

        let result = model
            .completion_request(prompt.as_str())
            .preamble(preamble)
            .temperature(temperature)
            .max_tokens(MAX_TOKENS)
            .send()
            .instrument(span.clone())
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let err = classify(&e.to_string());
                genai::record_error(&span, &err.kind.to_string());
                return Err(err);
            }
        };

        genai::record_token_usage(&span, response.usage.input_tokens, response.usage.output_tokens);
        let tokens = metrics::llm_tokens();
        let labels = |direction: &'static str| {
            [
                KeyValue::new("model", self.model.clone()),
                KeyValue::new("provider", PROVIDER),
                KeyValue::new("direction", direction),
            ]
        };
        tokens.add(response.usage.input_tokens, &labels("input"));
        tokens.add(response.usage.output_tokens, &labels("output"));

        let text: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect();
        span.in_scope(|| debug!(task, chars = text.len(), "model replied"));
        Ok(text)
    }
}

fn temperature(mode: Mode) -> f64 {
    match mode {
        Mode::Conservative => 0.5,
        Mode::Balanced => 0.8,
        Mode::Adventurous => 1.0,
    }
}

fn labels(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let letter = (b'A' + (i % 26) as u8) as char;
            if i < 26 { letter.to_string() } else { format!("{letter}{}", i / 26) }
        })
        .collect()
}

fn context_preamble(context: &TranslationContext) -> String {
    let mut p = format!(
        "You translate poetry from {} into {}. Mode: {}.",
        context.source_language, context.target_language, context.mode
    );
    if let Some(title) = &context.title {
        p.push_str(&format!(" The poem is titled \"{title}\"."));
    }
    if let Some(notes) = &context.notes {
        p.push_str(&format!(" Notes from the translator: {notes}"));
    }
    p.push_str(" Reply with JSON only.");
    p
}

// ---------------------------------------------------------------------------
// Reply shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VariantReply {
    #[serde(default)]
    label: Option<String>,
    text: String,
    #[serde(default)]
    approach: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

impl VariantReply {
    fn into_variant(self, label: String) -> Variant {
        let self_report = (self.approach.is_some() || self.confidence.is_some()).then(|| SelfReport {
            approach: self.approach,
            confidence: self.confidence,
        });
        Variant {
            label: self.label.unwrap_or(label),
            text: self.text.trim().to_string(),
            self_report,
            alignment: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VariantsReply {
    variants: Vec<VariantReply>,
}

#[derive(Deserialize)]
struct CandidatesReply {
    candidates: Vec<VariantReply>,
}

#[derive(Deserialize)]
struct AlignmentReply {
    alignments: Vec<Vec<AlignedWord>>,
}

#[derive(Deserialize)]
struct RecipesReply {
    recipes: Vec<Recipe>,
}

/// Slice out the outermost JSON object or array of a model reply.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn parse_reply<T: DeserializeOwned>(text: &str) -> std::result::Result<T, UpstreamError> {
    let json = extract_json(text)
        .ok_or_else(|| UpstreamError::new(UpstreamErrorKind::Malformed, "reply contains no JSON"))?;
    serde_json::from_str(json)
        .map_err(|e| UpstreamError::new(UpstreamErrorKind::Malformed, format!("unparseable reply: {e}")))
}

/// Map a transport or provider error message onto an error kind.
///
/// Unrecognized transport failures retry like timeouts.
pub fn classify(message: &str) -> UpstreamError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        UpstreamErrorKind::RateLimited
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("authentication")
        || lower.contains("x-api-key")
        || lower.contains("invalid_request")
    {
        UpstreamErrorKind::Fatal
    } else if lower.contains("json") || lower.contains("deserializ") {
        UpstreamErrorKind::Malformed
    } else {
        UpstreamErrorKind::Timeout
    };
    UpstreamError::new(kind, message)
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Translator for AnthropicCollaborator {
    async fn translate(
        &self,
        source: &str,
        context: &TranslationContext,
        recipes: Option<&RecipeBundle>,
    ) -> std::result::Result<Vec<Variant>, UpstreamError> {
        let wanted = labels(self.variants_per_line);
        let mut prompt = format!(
            "Translate this line into {} distinct variants labelled {}.\n\nLine: {source}\n",
            wanted.len(),
            wanted.join(", ")
        );
        if let Some(bundle) = recipes {
            prompt.push_str("\nFollow one recipe per label:\n");
            for r in &bundle.recipes {
                prompt.push_str(&format!("- {}: lens \"{}\". {}\n", r.label, r.lens, r.directive));
            }
        }
        prompt.push_str(
            "\nReply as {\"variants\": [{\"label\": \"A\", \"text\": \"...\", \
             \"approach\": \"one or two words\", \"confidence\": 0.0-1.0}]}",
        );

        let reply = self
            .chat("translate", context_preamble(context), prompt, temperature(context.mode))
            .await?;
        let parsed: VariantsReply = parse_reply(&reply)?;
        if parsed.variants.len() != wanted.len() {
            return Err(UpstreamError::new(
                UpstreamErrorKind::Validation,
                format!("expected {} variants, got {}", wanted.len(), parsed.variants.len()),
            ));
        }
        let variants: Vec<Variant> = parsed
            .variants
            .into_iter()
            .zip(wanted)
            .map(|(v, label)| v.into_variant(label))
            .collect();
        if variants.iter().any(|v| v.text.is_empty()) {
            return Err(UpstreamError::new(UpstreamErrorKind::Validation, "empty variant text"));
        }
        Ok(variants)
    }

    async fn regenerate_one(
        &self,
        request: &RegenerateRequest,
    ) -> std::result::Result<Vec<Variant>, UpstreamError> {
        let keep: Vec<String> = request
            .good
            .iter()
            .map(|v| format!("- {}: {}", v.label, v.text))
            .collect();
        let prompt = format!(
            "Line: {}\n\nThese translations stay:\n{}\n\nWrite {} alternative(s) for slot {} \
             that read clearly differently from all of them.\n\
             Do not begin with: {}.\nAvoid these shapes: {}.\n\
             Reply as {{\"candidates\": [{{\"text\": \"...\", \"approach\": \"...\"}}]}}",
            request.source,
            keep.join("\n"),
            request.samples,
            request.worst.label,
            request.constraints.forbidden_openings.join(" | "),
            request.constraints.forbidden_patterns.join(" | "),
        );

        let reply = self
            .chat(
                "regenerate",
                context_preamble(&request.context),
                prompt,
                temperature(request.context.mode),
            )
            .await?;
        let parsed: CandidatesReply = parse_reply(&reply)?;
        Ok(parsed
            .candidates
            .into_iter()
            .map(|c| c.into_variant(request.worst.label.clone()))
            .collect())
    }
}

#[async_trait::async_trait]
impl Aligner for AnthropicCollaborator {
    async fn align(
        &self,
        source: &str,
        variants: &[String],
    ) -> std::result::Result<Vec<Vec<AlignedWord>>, UpstreamError> {
        let numbered: Vec<String> = variants
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{}. {v}", i + 1))
            .collect();
        let prompt = format!(
            "Source line: {source}\n\nTranslations:\n{}\n\nFor each translation, in order, \
             list word-level correspondences.\n\
             Reply as {{\"alignments\": [[{{\"source\": \"...\", \"target\": \"...\"}}]]}}",
            numbered.join("\n")
        );

        let reply = self
            .chat(
                "align",
                "You align words between a source line and its translations. Reply with JSON only."
                    .to_string(),
                prompt,
                0.0,
            )
            .await?;
        let parsed: AlignmentReply = parse_reply(&reply)?;
        if parsed.alignments.len() != variants.len() {
            return Err(UpstreamError::new(
                UpstreamErrorKind::Validation,
                format!(
                    "expected {} alignments, got {}",
                    variants.len(),
                    parsed.alignments.len()
                ),
            ));
        }
        Ok(parsed.alignments)
    }
}

#[async_trait::async_trait]
impl RecipeGenerator for AnthropicCollaborator {
    async fn generate_recipes(
        &self,
        context: &TranslationContext,
        mode: Mode,
    ) -> std::result::Result<RecipeBundle, UpstreamError> {
        let wanted = labels(self.variants_per_line);
        let prompt = format!(
            "Design {} contrasting translation recipes for this poem, labelled {}. \
             Each recipe has a lens (a short name for its angle) and a directive \
             (one sentence telling the translator what to prioritise).\n\
             Reply as {{\"recipes\": [{{\"label\": \"A\", \"lens\": \"...\", \"directive\": \"...\"}}]}}",
            wanted.len(),
            wanted.join(", ")
        );

        let reply = self
            .chat("recipes", context_preamble(context), prompt, temperature(mode))
            .await?;
        let parsed: RecipesReply = parse_reply(&reply)?;
        if parsed.recipes.is_empty() {
            return Err(UpstreamError::new(UpstreamErrorKind::Validation, "no recipes returned"));
        }
        Ok(RecipeBundle::new(mode, context.content_hash(), parsed.recipes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_tolerates_fences_and_prose() {
        let reply = "Here you go:\n```json\n{\"variants\": []}\n```\nEnjoy.";
        assert_eq!(extract_json(reply), Some("{\"variants\": []}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn malformed_reply_is_retryable() {
        let err = parse_reply::<VariantsReply>("{\"variants\": [").unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::Malformed);
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_maps_common_failures() {
        assert_eq!(classify("HTTP 429 Too Many Requests").kind, UpstreamErrorKind::RateLimited);
        assert_eq!(classify("401 invalid x-api-key").kind, UpstreamErrorKind::Fatal);
        assert_eq!(classify("connection reset by peer").kind, UpstreamErrorKind::Timeout);
    }

    #[test]
    fn labels_are_letters() {
        assert_eq!(labels(3), vec!["A", "B", "C"]);
    }

    #[test]
    fn variant_reply_keeps_self_report() {
        let reply: VariantsReply = parse_reply(
            r#"{"variants":[{"text":" quiet water ","approach":"literal","confidence":0.7}]}"#,
        )
        .unwrap();
        let v = reply.variants.into_iter().next().unwrap().into_variant("A".into());
        assert_eq!(v.label, "A");
        assert_eq!(v.text, "quiet water");
        assert_eq!(v.self_report.and_then(|r| r.approach).as_deref(), Some("literal"));
    }
}
