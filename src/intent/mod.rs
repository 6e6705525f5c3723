//! Query-intent contract.
//!
//! The natural-language intent parser is an external collaborator behind an
//! OpenAI-compatible endpoint; only its JSON contract matters here. Any
//! failure — endpoint down, garbage reply, unknown intent — degrades to
//! `General`, never to an error.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::IntentConfig;

/// Declared intent of a search query. Drives fusion weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    /// Pure file-name/metadata lookup.
    Keyword,
    /// Pure content description.
    Semantic,
    Person,
    Location,
    Time,
    #[default]
    General,
}

/// The collaborator's reply: `{"intent": "...", "subject": "..."}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentDeclaration {
    #[serde(default)]
    pub intent: QueryIntent,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Parse a declaration, degrading to `General` on any shape mismatch.
pub fn parse_declaration(json: &str) -> IntentDeclaration {
    serde_json::from_str(json).unwrap_or_default()
}

// Request/response structs for the OpenAI-compatible chat API
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Thin client for the external intent parser.
pub struct IntentClient {
    config: IntentConfig,
}

impl IntentClient {
    pub fn new(config: IntentConfig) -> Self {
        Self { config }
    }

    /// Classify a query. Disabled or failing endpoints yield `General`.
    pub fn classify(&self, query: &str) -> QueryIntent {
        if !self.config.enabled {
            return QueryIntent::General;
        }

        match self.request_declaration(query) {
            Ok(declaration) => declaration.intent,
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, using general");
                QueryIntent::General
            }
        }
    }

    fn request_declaration(&self, query: &str) -> Result<IntentDeclaration> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: format!(
                    "Classify the intent of this photo search query as one of: \
                     keyword, semantic, person, location, time, general. \
                     Reply with JSON only, like {{\"intent\": \"semantic\", \"subject\": \"...\"}}.\n\n\
                     Query: {query}"
                ),
            }],
            max_tokens: 100,
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.config.endpoint);
        let mut call = ureq::post(&url).set("Content-Type", "application/json");
        if let Some(key) = &self.config.api_key {
            call = call.set("Authorization", &format!("Bearer {key}"));
        }

        let response = call
            .send_json(&request)
            .map_err(|e| anyhow!("intent request failed: {}", e))?;

        let chat_response: ChatResponse = response
            .into_json()
            .map_err(|e| anyhow!("failed to parse intent response: {}", e))?;

        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        let json = extract_json_object(content)
            .ok_or_else(|| anyhow!("no JSON object in intent reply"))?;
        Ok(parse_declaration(json))
    }
}

/// Pull the first balanced `{...}` out of a chatty model reply.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
