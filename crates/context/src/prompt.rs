//! Prompt Builder - Turns assembled context into a generation request
//!
//! Pure and deterministic: the same inputs always produce the same request.

use crate::providers::ContextItem;
use crate::query_analyzer::Sentiment;
use hal_common::config::LlmConfig;
use hal_common::UserFact;
use serde::{Deserialize, Serialize};

/// Shown to the model when every provider came back empty
pub const NO_CONTEXT: &str = "No context available.";

const PERSONA: &str = "You are HAL, a sharp assistant for technical questions. \
Answer directly, in plain text and full sentences. \
Ground your answer in the context below and say so when it does not cover the question. \
Never invent sources.";

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Request payload for an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

impl GenerationRequest {
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// Sampling options copied into every request
#[derive(Debug, Clone)]
pub struct PromptSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&LlmConfig> for PromptSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

pub struct PromptBuilder {
    settings: PromptSettings,
}

impl PromptBuilder {
    pub fn new(settings: PromptSettings) -> Self {
        Self { settings }
    }

    /// Build the streaming generation request for a query
    pub fn build(
        &self,
        query: &str,
        context: &[ContextItem],
        sentiment: Sentiment,
        facts: &[UserFact],
    ) -> GenerationRequest {
        let system = format!(
            "{}\n{}\n\n{}\n\nContext:\n{}",
            PERSONA,
            style_instruction(sentiment),
            render_facts(facts),
            render_context(context),
        );

        GenerationRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: system,
                },
                ChatMessage {
                    role: Role::User,
                    content: query.trim().to_string(),
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stream: true,
        }
    }
}

/// Tone only; never the substance of the answer
fn style_instruction(sentiment: Sentiment) -> &'static str {
    match sentiment {
        Sentiment::Negative => "The user sounds frustrated: be brief and get straight to the fix.",
        Sentiment::Neutral => "Keep the answer focused and reasonably concise.",
        Sentiment::Positive => "The user is curious: feel free to elaborate with an example.",
    }
}

fn render_facts(facts: &[UserFact]) -> String {
    if facts.is_empty() {
        return "No known user facts.".to_string();
    }
    let mut out = String::from("Known user facts:");
    for fact in facts {
        out.push_str(&format!("\n- {}: {}", fact.key, fact.value));
    }
    out
}

fn render_context(items: &[ContextItem]) -> String {
    if items.is_empty() {
        return NO_CONTEXT.to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "[{}] ({}: {})\n{}",
                i + 1,
                item.source.as_str(),
                item.origin,
                item.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
