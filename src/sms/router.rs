//! Inbound SMS routing and the multi-agent dispatcher.
//!
//! The configured owner number gets the personal assistant (reasoning
//! model, full tool access, plus the literal-command fast path); everyone
//! else gets the receptionist (fast model, no tools). Tool calls run
//! synchronously in a loop until the model produces plain text.

use crate::config::SmsConfig;
use crate::models::llm::{ContentBlock, ToolChat};
use crate::phone::PhoneNumber;
use crate::settings::Settings;
use crate::sms::commands::{CommandAction, CommandHandler};
use crate::sms::personas::PersonaRegistry;
use crate::sms::tools::{tool_specs, PendingCall, PendingCallQueue, SendSmsFn, ToolExecutor};
use crate::store::Store;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Cap on tool round trips per message.
const MAX_TOOL_ROUNDS: usize = 5;

/// Routes inbound SMS to the right agent persona.
pub struct SmsRouter {
    config: SmsConfig,
    settings: Settings,
    owner: PhoneNumber,
    store: Store,
    chat: Box<dyn ToolChat>,
    personas: PersonaRegistry,
    commands: CommandHandler,
    executor: ToolExecutor,
    pending: PendingCallQueue,
}

impl SmsRouter {
    /// Assemble a router.
    #[must_use]
    pub fn new(
        config: SmsConfig,
        settings: Settings,
        store: Store,
        chat: Box<dyn ToolChat>,
    ) -> Self {
        let owner = PhoneNumber::normalize(&settings.callback_number);
        let pending: PendingCallQueue = Arc::new(Mutex::new(VecDeque::new()));
        let executor = ToolExecutor::new(store.clone(), owner.clone(), Arc::clone(&pending));
        Self {
            config,
            settings,
            owner,
            store: store.clone(),
            chat,
            personas: PersonaRegistry::default(),
            commands: CommandHandler::new(store),
            executor,
            pending,
        }
    }

    /// Replace the default personas.
    #[must_use]
    pub fn with_personas(mut self, personas: PersonaRegistry) -> Self {
        self.personas = personas;
        self
    }

    /// Register the SMS send callback used by the `send_sms` tool and the
    /// owner's `text` command.
    pub fn on_send_sms(&mut self, callback: SendSmsFn) {
        self.executor.on_send_sms(callback);
    }

    /// Whether the sender is the configured owner.
    #[must_use]
    pub fn is_owner(&self, sender: &str) -> bool {
        !self.owner.is_empty() && PhoneNumber::normalize(sender) == self.owner
    }

    /// Next queued outbound call job, if any.
    #[must_use]
    pub fn get_pending_call(&self) -> Option<PendingCall> {
        self.pending.lock().ok()?.pop_front()
    }

    /// Whether call jobs are waiting for the scheduler.
    #[must_use]
    pub fn has_pending_calls(&self) -> bool {
        self.pending
            .lock()
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Process an inbound SMS and produce the reply to send, if any.
    #[must_use]
    pub fn process_message(&self, sender: &str, body: &str) -> Option<String> {
        let sender_number = PhoneNumber::normalize(sender);
        let is_owner = self.is_owner(sender);
        info!(
            "SMS from {}: {}",
            if is_owner { "owner" } else { sender },
            preview(body)
        );

        if let Err(e) = self.store.save_message(
            "sms",
            "inbound",
            sender_number.digits(),
            self.settings.callback_number.as_str(),
            body,
            "received",
        ) {
            warn!("failed to log inbound SMS: {e}");
        }

        let reply = if is_owner {
            self.process_owner_message(&sender_number, body)
        } else {
            self.process_other_message(&sender_number, body)
        };

        reply.map(|text| truncate_chars(&text, self.config.reply_limit))
    }

    /// Owner path: literal commands first, then the assistant with tools.
    fn process_owner_message(&self, sender: &PhoneNumber, body: &str) -> Option<String> {
        if let Some(action) = self
            .commands
            .interpret(body, chrono::Local::now().naive_local())
        {
            return Some(self.run_command(action));
        }

        let persona = self.personas.for_sms(true);
        let base_prompt = self.settings.substitute(&persona.persona_prompt, &[]);
        let history = self.thread_history(sender);

        let system = format!(
            "{base_prompt}\n\nCURRENT CONTEXT:\n- Location: {}\n- Your boss: {}\n{history}\n\
             Keep responses SHORT - this is SMS.",
            self.settings.city, self.settings.my_name
        );

        let tools = tool_specs(&persona.tools_allowed);
        self.tool_loop(persona.model_tier, &system, body, &tools)
    }

    /// Everyone else: receptionist, no tools, autopilot honored.
    fn process_other_message(&self, sender: &PhoneNumber, body: &str) -> Option<String> {
        if self.store.is_autopilot_disabled(sender) {
            info!("autopilot disabled for {sender}, staying quiet");
            return None;
        }

        let persona = self.personas.for_sms(false);
        let lead = self.store.get_lead_by_phone(sender).ok().flatten();
        let lead_pairs = lead
            .as_ref()
            .map(crate::store::Lead::context_pairs)
            .unwrap_or_default();
        let base_prompt = self
            .settings
            .substitute(&persona.persona_prompt, &lead_pairs);

        let lead_context = lead
            .as_ref()
            .map(|l| format!("\nCaller info: {} at {}", l.full_name(), l.company))
            .unwrap_or_default();
        let history = self.thread_history(sender);

        let system = format!(
            "{base_prompt}{lead_context}\n{history}\n\
             Write a brief, natural SMS reply (under 160 chars if possible). \
             Be conversational and human-like."
        );

        self.tool_loop(persona.model_tier, &system, body, &[])
    }

    fn run_command(&self, action: CommandAction) -> String {
        match action {
            CommandAction::Reply(reply) => {
                if reply.starts_with("Leads:") && self.has_pending_calls() {
                    let pending = self.pending.lock().map(|q| q.len()).unwrap_or(0);
                    format!("{reply}, Pending calls: {pending}")
                } else {
                    reply
                }
            }
            CommandAction::QueueCall { job, reply } => {
                if let Ok(mut queue) = self.pending.lock() {
                    queue.push_back(job);
                }
                reply
            }
            CommandAction::SendSms { to, body, reply } => {
                let result = self
                    .executor
                    .execute("send_sms", &json!({"phone_number": to.digits(), "message": body}));
                if result["success"] == json!(true) {
                    reply
                } else {
                    format!(
                        "Couldn't send that: {}",
                        result["error"].as_str().unwrap_or("unknown error")
                    )
                }
            }
        }
    }

    /// Run the model, executing tool calls until it answers in plain text.
    fn tool_loop(
        &self,
        tier: crate::models::ModelTier,
        system: &str,
        body: &str,
        tools: &[Value],
    ) -> Option<String> {
        let mut messages = vec![json!({"role": "user", "content": body})];

        for _round in 0..MAX_TOOL_ROUNDS {
            let blocks = match self.chat.chat(tier, system, &messages, tools, 1000) {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!("SMS agent failed: {e}");
                    return Some(format!("Error: {}", truncate_chars(&e.to_string(), 100)));
                }
            };

            let tool_uses: Vec<(String, String, Value)> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    ContentBlock::Text(_) => None,
                })
                .collect();

            if tool_uses.is_empty() {
                let text: String = blocks
                    .into_iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text(t) => Some(t),
                        ContentBlock::ToolUse { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let text = text.trim().to_owned();
                return if text.is_empty() {
                    Some("Done.".to_owned())
                } else {
                    Some(text)
                };
            }

            // Echo the assistant's blocks back, then feed each result.
            messages.push(json!({
                "role": "assistant",
                "content": blocks_to_content(&blocks),
            }));
            let mut results = Vec::new();
            for (id, name, input) in tool_uses {
                let result = self.executor.execute(&name, &input);
                info!("tool {name}: {}", preview(&result.to_string()));
                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": result.to_string(),
                }));
            }
            messages.push(json!({"role": "user", "content": results}));
        }

        warn!("tool loop exceeded {MAX_TOOL_ROUNDS} rounds");
        Some("Done.".to_owned())
    }

    /// Recent thread history formatted for the system prompt.
    fn thread_history(&self, sender: &PhoneNumber) -> String {
        let messages = match self
            .store
            .conversation_messages(sender, self.config.history_limit)
        {
            Ok(m) if !m.is_empty() => m,
            _ => return String::new(),
        };

        let mut history = String::from("\nRecent conversation:\n");
        for message in messages {
            let who = if message.direction == "inbound" {
                "Them"
            } else {
                "Me"
            };
            history.push_str(&format!("{who}: {}\n", truncate_chars(&message.body, 100)));
        }
        history
    }
}

fn blocks_to_content(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text(text) => json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
        })
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        text.chars().take(max).collect()
    }
}

fn preview(text: &str) -> String {
    truncate_chars(text, 50)
}
