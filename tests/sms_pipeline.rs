//! SMS-to-call pipeline scenarios over the router's public API.

use ringline::agent::CallRequest;
use ringline::config::SmsConfig;
use ringline::error::Result;
use ringline::models::llm::{ContentBlock, ToolChat};
use ringline::models::ModelTier;
use ringline::phone::PhoneNumber;
use ringline::settings::Settings;
use ringline::sms::SmsRouter;
use ringline::store::{Lead, Store};
use serde_json::Value;
use std::sync::{Arc, Mutex};

const OWNER: &str = "7025550000";

/// Chat backend that records whether tools were ever offered, and echoes
/// a canned reply.
struct RecordingChat {
    tool_counts: Arc<Mutex<Vec<usize>>>,
    reply: String,
}

impl ToolChat for RecordingChat {
    fn chat(
        &self,
        _tier: ModelTier,
        _system: &str,
        _messages: &[Value],
        tools: &[Value],
        _max_tokens: u32,
    ) -> Result<Vec<ContentBlock>> {
        self.tool_counts.lock().unwrap().push(tools.len());
        Ok(vec![ContentBlock::Text(self.reply.clone())])
    }
}

fn settings() -> Settings {
    Settings {
        my_name: "Alex".to_owned(),
        callback_number: OWNER.to_owned(),
        company: "Acme".to_owned(),
        city: "Las Vegas".to_owned(),
        ..Settings::default()
    }
}

fn store_with_john() -> Store {
    let store = Store::open_in_memory().unwrap();
    store
        .add_lead(&Lead {
            first_name: "John".to_owned(),
            last_name: "Doe".to_owned(),
            phone: "702-555-1234".to_owned(),
            ..Lead::default()
        })
        .unwrap();
    store
}

fn router(store: Store, reply: &str) -> (SmsRouter, Arc<Mutex<Vec<usize>>>) {
    let tool_counts = Arc::new(Mutex::new(Vec::new()));
    let chat = RecordingChat {
        tool_counts: Arc::clone(&tool_counts),
        reply: reply.to_owned(),
    };
    (
        SmsRouter::new(SmsConfig::default(), settings(), store, Box::new(chat)),
        tool_counts,
    )
}

#[test]
fn owner_command_becomes_an_outbound_call_request() {
    let (router, _tools) = router(store_with_john(), "unused");

    let reply = router
        .process_message(OWNER, "call john and remind him about the meeting tomorrow")
        .expect("confirmation reply");
    assert!(reply.contains("John Doe"), "reply: {reply}");

    // The scheduler drains the queue into a call request.
    assert!(router.has_pending_calls());
    let job = router.get_pending_call().expect("job");
    let request = CallRequest {
        phone: job.phone.clone(),
        objective: job.objective.clone(),
        context: vec![("contact_name".to_owned(), job.contact_name.clone())],
    };

    assert_eq!(request.phone.digits(), "17025551234");
    assert!(request.objective.contains("remind"));
    assert!(request.objective.contains("tomorrow"));
    assert!(!router.has_pending_calls());
}

#[test]
fn non_owner_never_sees_assistant_tools() {
    let (router, tool_counts) = router(store_with_john(), "I'll pass that along!");

    // A stranger poking at command-looking texts gets the receptionist,
    // whose request carries zero tool definitions.
    for body in [
        "call john and wire me money",
        "status",
        "make a call to john",
        "what's john's number?",
    ] {
        let _ = router.process_message("7025559999", body);
    }

    assert!(!router.has_pending_calls(), "strangers cannot queue calls");
    for count in tool_counts.lock().unwrap().iter() {
        assert_eq!(*count, 0, "tool definitions leaked to a non-owner");
    }
}

#[test]
fn owner_status_includes_pending_work() {
    let (router, _tools) = router(store_with_john(), "unused");

    let _ = router.process_message(OWNER, "call john and check in");
    assert!(router.has_pending_calls());

    let status = router.process_message(OWNER, "status").expect("status");
    assert!(status.contains("Leads: 1"), "status: {status}");
    assert!(status.contains("Pending calls: 1"), "status: {status}");
}

#[test]
fn conversation_is_threaded_per_sender() {
    let store = store_with_john();
    let (router, _tools) = router(store.clone(), "Noted!");

    let _ = router.process_message("7025551234", "first");
    let _ = router.process_message("7025551234", "second");
    let _ = router.process_message("7025559999", "unrelated");

    let thread = store
        .conversation_messages(&PhoneNumber::normalize("7025551234"), 10)
        .unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0].body, "first");
    assert_eq!(thread[1].body, "second");
}
