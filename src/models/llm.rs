//! Language model adapters: the stateful voice session and the stateless
//! tool-capable chat used by the SMS router.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::models::ModelTier;
use crate::phone::PhoneNumber;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

/// Fixed apology spoken when a model call fails mid-conversation; the
/// engine stays in the call.
pub const APOLOGY: &str = "I'm sorry, I'm having trouble responding. Could you repeat that?";

/// Marker the assistant emits when the caller should be transferred.
pub const TRANSFER_MARKER: &str = "[TRANSFER]";

/// One message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    /// Present when this turn carried a tool invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use: Option<ToolUse>,
}

impl Turn {
    /// A plain user turn.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            tool_use: None,
        }
    }

    /// A plain assistant turn.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            tool_use: None,
        }
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolResult,
}

/// A tool invocation recorded on a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// A block of model output.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Stateful conversation model for a single voice call.
///
/// History grows in place; the full sequence is sent on every request.
pub trait LanguageModel: Send {
    /// Install the call objective, context pairs, and any retrieved
    /// knowledge into the system prompt. Resets history.
    fn set_objective(&mut self, objective: &str, context: &[(String, String)], knowledge: Option<&str>);

    /// Append `user_text` and return the next assistant turn.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails; the engine substitutes
    /// the fixed apology and stays in the call.
    fn generate_response(&mut self, user_text: &str) -> Result<String>;

    /// First assistant utterance, as if the user had said "Hello?".
    /// Pre-seeds history with the `Hello?`/greeting pair.
    fn initial_greeting(&mut self) -> String;

    /// The conversation so far.
    fn history(&self) -> &[Turn];

    /// Whether `text` closes the conversation with a farewell.
    fn should_end_call(&self, text: &str) -> bool {
        is_farewell(text)
    }

    /// Whether `text` carries the transfer marker.
    fn should_transfer(&self, text: &str) -> bool {
        text.contains(TRANSFER_MARKER)
    }

    /// Transfer target from the call context, when configured.
    fn transfer_number(&self) -> Option<PhoneNumber>;
}

/// Stateless chat with tool definitions; each call carries its own
/// message list. Used by the SMS router's tool loop.
pub trait ToolChat: Send + Sync {
    /// One Messages-API round trip.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable or rejects the
    /// request.
    fn chat(
        &self,
        tier: ModelTier,
        system: &str,
        messages: &[Value],
        tools: &[Value],
        max_tokens: u32,
    ) -> Result<Vec<ContentBlock>>;
}

/// Whether the text mentions a standard farewell.
#[must_use]
pub fn is_farewell(text: &str) -> bool {
    const FAREWELLS: [&str; 7] = [
        "goodbye",
        "bye",
        "have a great day",
        "have a good day",
        "take care",
        "thank you for your time",
        "thanks for your time",
    ];
    let lower = text.to_lowercase();
    FAREWELLS.iter().any(|phrase| lower.contains(phrase))
}

/// Messages-API client shared by the voice session and the SMS router.
#[derive(Clone)]
pub struct AnthropicClient {
    config: LlmConfig,
    agent: ureq::Agent,
}

impl AnthropicClient {
    /// Create a client from the LLM config.
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            agent: ureq::agent(),
        }
    }

    /// One request against the Messages API.
    fn messages(
        &self,
        model: &str,
        system: &str,
        messages: &[Value],
        tools: &[Value],
        max_tokens: u32,
    ) -> Result<Vec<ContentBlock>> {
        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let response = self
            .agent
            .post(&self.config.api_url)
            .set("x-api-key", &self.config.api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(body)
            .map_err(|e| AgentError::Llm(format!("request failed: {e}")))?;

        let parsed: Value = response
            .into_json()
            .map_err(|e| AgentError::Llm(format!("bad response: {e}")))?;

        let content = parsed
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentError::Llm("response missing content".into()))?;

        let mut blocks = Vec::new();
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        blocks.push(ContentBlock::Text(text.to_owned()));
                    }
                }
                Some("tool_use") => {
                    blocks.push(ContentBlock::ToolUse {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
        Ok(blocks)
    }
}

impl ToolChat for AnthropicClient {
    fn chat(
        &self,
        tier: ModelTier,
        system: &str,
        messages: &[Value],
        tools: &[Value],
        max_tokens: u32,
    ) -> Result<Vec<ContentBlock>> {
        let model = tier.model_id(&self.config).to_owned();
        self.messages(&model, system, messages, tools, max_tokens)
    }
}

/// Stateful voice-call session over the Messages API.
pub struct AnthropicLlm {
    client: AnthropicClient,
    model: String,
    max_tokens: u32,
    system_prompt: String,
    history: Vec<Turn>,
    context: Vec<(String, String)>,
}

impl AnthropicLlm {
    /// Create a session at the given tier.
    #[must_use]
    pub fn new(config: &LlmConfig, tier: ModelTier) -> Self {
        let model = tier.model_id(config).to_owned();
        info!("LLM session ready (model={model})");
        Self {
            client: AnthropicClient::new(config.clone()),
            model,
            max_tokens: config.max_tokens,
            system_prompt: String::new(),
            history: Vec::new(),
            context: Vec::new(),
        }
    }

    fn request(&self, messages: &[Value]) -> Result<String> {
        let blocks = self.client.messages(
            &self.model,
            &self.system_prompt,
            messages,
            &[],
            self.max_tokens,
        )?;
        let text: String = blocks
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" ");
        Ok(text.trim().to_owned())
    }

    fn history_as_messages(&self) -> Vec<Value> {
        self.history
            .iter()
            .filter(|turn| turn.role != TurnRole::ToolResult)
            .map(|turn| {
                let role = match turn.role {
                    TurnRole::Assistant => "assistant",
                    _ => "user",
                };
                json!({"role": role, "content": turn.text})
            })
            .collect()
    }
}

impl LanguageModel for AnthropicLlm {
    fn set_objective(
        &mut self,
        objective: &str,
        context: &[(String, String)],
        knowledge: Option<&str>,
    ) {
        let context_lines: String = context
            .iter()
            .map(|(k, v)| format!("- {k}: {v}\n"))
            .collect();

        let mut prompt = format!(
            "You are a voice chatbot having a conversation. The other person has \
             just sent you a message.\n\n\
             YOUR GOAL:\n{objective}\n\n\
             ABOUT YOU:\n{context_lines}\n\
             RULES:\n\
             - Reply with SHORT responses (1-2 sentences)\n\
             - Just say words - no asterisks, no actions like *dials* or *waits*\n\
             - You are trying to accomplish YOUR goal - you need something from them\n\
             - Do not make up information you don't have"
        );
        if let Some(knowledge) = knowledge {
            if !knowledge.is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(knowledge);
            }
        }

        self.system_prompt = prompt;
        self.context = context.to_vec();
        self.history.clear();
        let preview: String = objective.chars().take(100).collect();
        info!("objective set: {preview}");
    }

    fn generate_response(&mut self, user_text: &str) -> Result<String> {
        if user_text.trim().is_empty() {
            return Ok(String::new());
        }

        self.history.push(Turn::user(user_text));
        let messages = self.history_as_messages();

        match self.request(&messages) {
            Ok(text) => {
                self.history.push(Turn::assistant(text.clone()));
                info!("assistant: {text}");
                Ok(text)
            }
            Err(e) => {
                // Drop the unanswered user turn so a retry re-sends it.
                let _ = self.history.pop();
                Err(e)
            }
        }
    }

    fn initial_greeting(&mut self) -> String {
        let seed = json!({"role": "user", "content": "Hello?"});
        match self.request(&[seed]) {
            Ok(greeting) if !greeting.is_empty() => {
                self.history = vec![Turn::user("Hello?"), Turn::assistant(greeting.clone())];
                greeting
            }
            Ok(_) | Err(_) => {
                error!("greeting generation failed, using canned greeting");
                let fallback = "Hello, how can I help you today?".to_owned();
                self.history = vec![Turn::user("Hello?"), Turn::assistant(fallback.clone())];
                fallback
            }
        }
    }

    fn history(&self) -> &[Turn] {
        &self.history
    }

    fn transfer_number(&self) -> Option<PhoneNumber> {
        self.context
            .iter()
            .find(|(k, _)| k == "TRANSFER_TO")
            .map(|(_, v)| PhoneNumber::normalize(v))
            .filter(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn farewell_detection() {
        assert!(is_farewell("Thank you, goodbye!"));
        assert!(is_farewell("Bye now"));
        assert!(is_farewell("Take care."));
        assert!(is_farewell("Thanks for your time today."));
        assert!(!is_farewell("Can you tell me the price?"));
        assert!(!is_farewell(""));
    }

    #[test]
    fn transfer_marker_detection() {
        let llm = AnthropicLlm::new(&LlmConfig::default(), ModelTier::Fast);
        assert!(llm.should_transfer("[TRANSFER] Please hold."));
        assert!(!llm.should_transfer("Let me check on that."));
    }

    #[test]
    fn transfer_number_comes_from_context() {
        let mut llm = AnthropicLlm::new(&LlmConfig::default(), ModelTier::Fast);
        assert!(llm.transfer_number().is_none());

        llm.set_objective(
            "Answer questions",
            &[("TRANSFER_TO".to_owned(), "702-555-1234".to_owned())],
            None,
        );
        assert_eq!(
            llm.transfer_number().unwrap().digits(),
            "17025551234"
        );
    }

    #[test]
    fn system_prompt_carries_objective_context_and_knowledge() {
        let mut llm = AnthropicLlm::new(&LlmConfig::default(), ModelTier::Fast);
        llm.set_objective(
            "Order a pizza",
            &[("name".to_owned(), "Scott".to_owned())],
            Some("RELEVANT KNOWLEDGE:\nLarge is $20"),
        );
        assert!(llm.system_prompt.contains("Order a pizza"));
        assert!(llm.system_prompt.contains("- name: Scott"));
        assert!(llm.system_prompt.contains("Large is $20"));
    }

    #[test]
    fn set_objective_resets_history() {
        let mut llm = AnthropicLlm::new(&LlmConfig::default(), ModelTier::Fast);
        llm.history.push(Turn::user("leftover"));
        llm.set_objective("New call", &[], None);
        assert!(llm.history().is_empty());
    }
}
