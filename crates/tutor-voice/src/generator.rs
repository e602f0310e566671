//! Tutor reply generation.
//!
//! [`ResponseGenerator`] takes the lesson language and level, the recent
//! conversation and the learner's latest utterance, and returns the tutor's
//! reply with an optional translation and correction notes. [`ChatTutor`] asks
//! an OpenAI-compatible chat-completions endpoint for a JSON object.

use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use tutor_core::{ConversationTurn, Correction, FeedbackKind, Speaker};

const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

/// Input to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub language: String,
    pub level_label: String,
    /// Recent turns, oldest first. Includes the utterance being answered.
    pub context: Vec<ConversationTurn>,
    pub user_text: String,
}

/// The tutor's answer to one user turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeneratedReply {
    pub reply_text: String,
    pub reply_translation: Option<String>,
    pub corrections: Vec<Correction>,
}

impl GeneratedReply {
    pub fn new(reply_text: impl Into<String>) -> Self {
        Self {
            reply_text: reply_text.into(),
            ..Default::default()
        }
    }

    pub fn with_translation(mut self, translation: impl Into<String>) -> Self {
        self.reply_translation = Some(translation.into());
        self
    }

    pub fn with_correction(mut self, correction: Correction) -> Self {
        self.corrections.push(correction);
        self
    }
}

/// Response generation capability.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError>;
}

// OpenAI-compatible request/response
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// The JSON object the tutor model is asked to produce.
#[derive(Deserialize)]
struct TutorJson {
    reply: String,
    #[serde(default)]
    translation: Option<String>,
    #[serde(default)]
    corrections: Vec<CorrectionJson>,
}

#[derive(Deserialize)]
struct CorrectionJson {
    error: String,
    correction: String,
    #[serde(default)]
    kind: Option<String>,
}

fn system_prompt(language: &str, level: &str) -> String {
    format!(
        "You are a friendly {language} conversation tutor for a learner at level {level}. \
         Keep replies short and natural, in {language}, suited to that level. \
         If the learner's last message has mistakes, list them as corrections. \
         Respond with a single JSON object and nothing else: \
         {{\"reply\": string, \"translation\": string (English), \
         \"corrections\": [{{\"error\": string, \"correction\": string, \
         \"kind\": \"grammar\"|\"vocabulary\"|\"pronunciation\"|\"fluency\"|\"comprehension\"}}]}}"
    )
}

/// Strip markdown fences and surrounding prose, keeping the outermost JSON object.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse the model's message content into a reply.
pub fn parse_reply(raw: &str) -> Result<GeneratedReply, GenerationError> {
    let json = extract_json(raw).ok_or_else(|| {
        GenerationError::MalformedResponse(format!("no JSON object in reply: {:.80}", raw))
    })?;
    let parsed: TutorJson = serde_json::from_str(json)
        .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

    let reply_text = parsed.reply.trim().to_string();
    if reply_text.is_empty() {
        return Err(GenerationError::MalformedResponse("empty reply".to_string()));
    }
    let corrections = parsed
        .corrections
        .into_iter()
        .filter(|c| !c.error.trim().is_empty())
        .map(|c| {
            let kind = c.kind.as_deref().and_then(|k| match k.parse::<FeedbackKind>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    debug!("Unknown correction kind '{}', treating as grammar", k);
                    None
                }
            });
            Correction {
                error: c.error.trim().to_string(),
                correction: c.correction.trim().to_string(),
                kind,
            }
        })
        .collect();

    Ok(GeneratedReply {
        reply_text,
        reply_translation: parsed
            .translation
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        corrections,
    })
}

fn status_error(status: StatusCode, body: &str) -> GenerationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PAYMENT_REQUIRED => {
            GenerationError::Unavailable(format!("LLM API error {}: {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GenerationError::Timeout,
        _ => GenerationError::Network(format!("LLM API error {}: {}", status, body)),
    }
}

/// Tutor backed by an OpenAI-compatible chat-completions API (OpenRouter by default).
pub struct ChatTutor {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ChatTutor {
    /// Build from environment: TUTOR_LLM_API_URL, TUTOR_LLM_API_KEY (or
    /// OPENROUTER_API_KEY), TUTOR_LLM_MODEL.
    pub fn from_env() -> Result<Self, GenerationError> {
        let base_url =
            std::env::var("TUTOR_LLM_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let api_key = std::env::var("TUTOR_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map(|k| k.trim().to_string())
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GenerationError::Unavailable(
                    "tutor requires TUTOR_LLM_API_KEY or OPENROUTER_API_KEY".to_string(),
                )
            })?;
        let tutor = Self::new(base_url, api_key)?;
        Ok(match std::env::var("TUTOR_LLM_MODEL") {
            Ok(model) if !model.trim().is_empty() => tutor.with_model(model.trim()),
            _ => tutor,
        })
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            client,
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    fn messages(request: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: system_prompt(&request.language, &request.level_label),
        }];
        for turn in &request.context {
            messages.push(ChatMessage {
                role: match turn.speaker {
                    Speaker::User => "user",
                    Speaker::Tutor => "assistant",
                },
                content: turn.text.clone(),
            });
        }
        // The context normally ends with the utterance being answered.
        let answered = request
            .context
            .last()
            .is_some_and(|t| t.speaker == Speaker::User && t.text == request.user_text);
        if !answered {
            messages.push(ChatMessage {
                role: "user",
                content: request.user_text.clone(),
            });
        }
        messages
    }
}

#[async_trait]
impl ResponseGenerator for ChatTutor {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: Self::messages(request),
            temperature: Some(0.6),
            max_tokens: Some(512),
            response_format: ResponseFormat { kind: "json_object" },
        };
        let url = format!("{}/chat/completions", self.base_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Tutor API returned {}", status);
            return Err(status_error(status, &body));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::MalformedResponse("no choices".to_string()))?;
        parse_reply(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"reply\": \"¡Muy bien!\", \"translation\": \"Very good!\", \
                   \"corrections\": [{\"error\": \"yo es\", \"correction\": \"yo soy\"}]}\n```";
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.reply_text, "¡Muy bien!");
        assert_eq!(reply.reply_translation.as_deref(), Some("Very good!"));
        assert_eq!(reply.corrections, vec![Correction::new("yo es", "yo soy")]);
    }

    #[test]
    fn correction_kinds_are_parsed_or_defaulted() {
        let raw = r#"{"reply":"Ok","corrections":[
            {"error":"a","correction":"b","kind":"Vocabulary"},
            {"error":"c","correction":"d","kind":"style"},
            {"error":"  ","correction":"ignored"}]}"#;
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.corrections.len(), 2);
        assert_eq!(reply.corrections[0].kind, Some(FeedbackKind::Vocabulary));
        assert_eq!(reply.corrections[1].kind, None);
        assert_eq!(reply.reply_translation, None);
    }

    #[test]
    fn rejects_missing_or_empty_reply() {
        assert!(matches!(
            parse_reply("Sorry, I can't help with that."),
            Err(GenerationError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_reply(r#"{"reply": "   "}"#),
            Err(GenerationError::MalformedResponse(_))
        ));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            GenerationError::RateLimited
        );
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "invalid key"),
            GenerationError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            GenerationError::Network(_)
        ));
    }

    #[test]
    fn context_maps_to_chat_roles() {
        let turn = |speaker, text: &str| ConversationTurn {
            id: Uuid::new_v4(),
            speaker,
            text: text.to_string(),
            translation: None,
            timestamp: Utc::now(),
        };
        let request = GenerationRequest {
            language: "Spanish".into(),
            level_label: "A1".into(),
            context: vec![
                turn(Speaker::User, "Hola"),
                turn(Speaker::Tutor, "¡Hola! ¿Qué tal?"),
                turn(Speaker::User, "Bien"),
            ],
            user_text: "Bien".into(),
        };
        let messages = ChatTutor::messages(&request);
        let roles: Vec<&str> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert!(messages[0].content.contains("Spanish"));
        assert!(messages[0].content.contains("A1"));
    }
}
