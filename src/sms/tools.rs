//! Tools the personal-assistant agent can invoke from SMS.
//!
//! Tool execution is synchronous; `make_call` only enqueues the outbound
//! call job and returns a receipt, it never blocks on the call itself.

use crate::phone::PhoneNumber;
use crate::store::Store;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// An outbound call job queued by `make_call`.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub phone: PhoneNumber,
    pub objective: String,
    pub lead_id: Option<i64>,
    pub contact_name: String,
    pub agent_id: String,
}

/// A web search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// External web search integration, contract only.
pub trait WebSearch: Send + Sync {
    /// Run a query; an unconfigured integration returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    fn search(&self, query: &str) -> crate::error::Result<Vec<SearchResult>>;
}

/// Callback used to actually put an SMS on the air.
pub type SendSmsFn = Box<dyn Fn(&PhoneNumber, &str) -> bool + Send + Sync>;

/// Shared queue of call jobs awaiting the outer scheduler.
pub type PendingCallQueue = Arc<Mutex<VecDeque<PendingCall>>>;

/// Executes assistant tool calls against the store, the modem, and the
/// optional integrations.
pub struct ToolExecutor {
    store: Store,
    web: Option<Box<dyn WebSearch>>,
    send_sms: Option<SendSmsFn>,
    pending: PendingCallQueue,
    /// The agent's own number, recorded as the sender of outbound SMS.
    own_number: PhoneNumber,
}

impl ToolExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(store: Store, own_number: PhoneNumber, pending: PendingCallQueue) -> Self {
        Self {
            store,
            web: None,
            send_sms: None,
            pending,
            own_number,
        }
    }

    /// Plug in a web search integration.
    pub fn with_web_search(mut self, web: Box<dyn WebSearch>) -> Self {
        self.web = Some(web);
        self
    }

    /// Register the SMS send callback (wired to the modem controller).
    pub fn on_send_sms(&mut self, callback: SendSmsFn) {
        self.send_sms = Some(callback);
    }

    /// Execute one tool call and return its JSON result.
    #[must_use]
    pub fn execute(&self, name: &str, input: &Value) -> Value {
        info!("executing tool {name}");
        match name {
            "search_contacts" => self.search_contacts(input),
            "search_web" => self.search_web(input),
            "get_movie_showtimes" => {
                json!({"success": false, "error": "showtimes integration not configured"})
            }
            "make_call" => self.make_call(input),
            "send_sms" => self.send_sms_tool(input),
            other => json!({"error": format!("unknown tool: {other}")}),
        }
    }

    fn search_contacts(&self, input: &Value) -> Value {
        let query = str_arg(input, "query");
        match self.store.search_leads(&query, 10) {
            Ok(leads) => {
                let results: Vec<Value> = leads
                    .iter()
                    .map(|lead| {
                        json!({
                            "name": lead.full_name(),
                            "company": lead.company,
                            "phone": lead.phone,
                            "status": lead.status,
                        })
                    })
                    .collect();
                json!({"results": results})
            }
            Err(e) => json!({"error": e.to_string()}),
        }
    }

    fn search_web(&self, input: &Value) -> Value {
        let query = str_arg(input, "query");
        let Some(web) = &self.web else {
            return json!({"success": false, "error": "web search not configured"});
        };
        match web.search(&query) {
            Ok(results) => {
                let results: Vec<Value> = results
                    .iter()
                    .map(|r| json!({"title": r.title, "url": r.url, "snippet": r.snippet}))
                    .collect();
                json!({"results": results})
            }
            Err(e) => json!({"error": e.to_string()}),
        }
    }

    fn make_call(&self, input: &Value) -> Value {
        let phone = PhoneNumber::normalize(&str_arg(input, "phone_number"));
        if phone.is_empty() {
            return json!({"success": false, "error": "no phone number given"});
        }
        let objective = str_arg(input, "objective");

        let lead = self.store.get_lead_by_phone(&phone).ok().flatten();
        let contact_name = lead
            .as_ref()
            .map(crate::store::Lead::full_name)
            .unwrap_or_else(|| phone.digits().to_owned());

        let job = PendingCall {
            phone: phone.clone(),
            objective: objective.clone(),
            lead_id: lead.map(|l| l.id),
            contact_name: contact_name.clone(),
            agent_id: input
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or("personal_assistant")
                .to_owned(),
        };
        if let Ok(mut queue) = self.pending.lock() {
            queue.push_back(job);
        }

        json!({
            "success": true,
            "message": format!("Call queued to {contact_name} at {phone}"),
            "objective": objective,
        })
    }

    fn send_sms_tool(&self, input: &Value) -> Value {
        let phone = PhoneNumber::normalize(&str_arg(input, "phone_number"));
        if phone.is_empty() {
            return json!({"success": false, "error": "no phone number given"});
        }
        let body = str_arg(input, "message");

        let Some(send) = &self.send_sms else {
            return json!({"success": false, "error": "SMS sending not configured"});
        };

        if send(&phone, &body) {
            if let Err(e) = self.store.save_message(
                "sms",
                "outbound",
                self.own_number.digits(),
                phone.digits(),
                &body,
                "sent",
            ) {
                warn!("failed to log outbound SMS: {e}");
            }
            json!({"success": true, "message": format!("SMS sent to {phone}")})
        } else {
            json!({"success": false, "error": "Failed to send SMS"})
        }
    }
}

fn str_arg(input: &Value, key: &str) -> String {
    input
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Tool definitions offered to the personal-assistant agent, filtered to
/// the persona's allow-list.
#[must_use]
pub fn tool_specs(allowed: &[String]) -> Vec<Value> {
    let all = [
        json!({
            "name": "search_contacts",
            "description": "Search the contact list by name, company, or phone substring.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Name, company, or phone fragment"}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "search_web",
            "description": "Search the web for current information.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_movie_showtimes",
            "description": "Look up movie showtimes near a location.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "location": {"type": "string"},
                    "movie": {"type": "string"}
                },
                "required": ["location"]
            }
        }),
        json!({
            "name": "make_call",
            "description": "Place an AI phone call. Queues the call and returns immediately; \
                            it does not wait for the call to happen.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "phone_number": {"type": "string"},
                    "objective": {"type": "string", "description": "What the call should accomplish"},
                    "agent_id": {"type": "string", "description": "Persona to use for the call"}
                },
                "required": ["phone_number", "objective"]
            }
        }),
        json!({
            "name": "send_sms",
            "description": "Send a text message.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "phone_number": {"type": "string"},
                    "message": {"type": "string"}
                },
                "required": ["phone_number", "message"]
            }
        }),
    ];

    all.into_iter()
        .filter(|spec| {
            spec.get("name")
                .and_then(Value::as_str)
                .map(|name| allowed.iter().any(|a| a == name))
                .unwrap_or(false)
        })
        .collect()
}
