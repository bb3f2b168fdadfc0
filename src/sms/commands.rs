//! Owner command grammar: the literal fast path beside the AI router.
//!
//! `call john and remind him about the meeting tomorrow` should not cost
//! an LLM round trip. Recognized commands resolve the contact and return
//! an action; anything unrecognized falls through to the AI path.

use crate::phone::PhoneNumber;
use crate::sms::tools::PendingCall;
use crate::store::{Lead, Store};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, Weekday};
use regex::Regex;
use tracing::info;

/// What a recognized command wants done.
#[derive(Debug)]
pub enum CommandAction {
    /// Just reply with text.
    Reply(String),
    /// Queue an outbound call and reply with the receipt.
    QueueCall { job: PendingCall, reply: String },
    /// Send an SMS and reply with the receipt.
    SendSms {
        to: PhoneNumber,
        body: String,
        reply: String,
    },
}

/// Literal-prefix command interpreter for the owner's texts.
pub struct CommandHandler {
    store: Store,
    call_re: Regex,
    book_re: Regex,
    remind_re: Regex,
    schedule_call_re: Regex,
    meeting_re: Regex,
    time_re: Regex,
}

impl CommandHandler {
    /// Create a handler over the lead store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            call_re: Regex::new(r"(?i)^(.+?)\s+(?:and|to)\s+(.+)$").expect("call regex"),
            book_re: Regex::new(r"(?i)^(.+?)\s+(?:for|on|at)\s+(.+)$").expect("book regex"),
            remind_re: Regex::new(r"(?i)^remind\s+(\w+)\s+(?:about\s+)?(.+)$")
                .expect("remind regex"),
            schedule_call_re: Regex::new(r"(?i)^(?:schedule|make)\s+(?:a\s+)?call\s+(?:with|to)\s+(\w+)")
                .expect("schedule regex"),
            meeting_re: Regex::new(
                r"(?i)^(?:set up|schedule)\s+(?:a\s+)?meeting\s+with\s+(\w+)\s+(?:for|on)\s+(.+)$",
            )
            .expect("meeting regex"),
            time_re: Regex::new(r"(?i)(\d{1,2})(?::(\d{2}))?\s*(am|pm)?").expect("time regex"),
        }
    }

    /// Interpret an owner message. `None` means "not a command" and the
    /// AI path should handle it.
    #[must_use]
    pub fn interpret(&self, message: &str, now: NaiveDateTime) -> Option<CommandAction> {
        let message = message.trim();
        let lower = message.to_lowercase();

        if let Some(rest) = strip_prefix_ci(message, "call ") {
            return Some(self.handle_call(rest));
        }
        if let Some(rest) = strip_prefix_ci(message, "book ") {
            return Some(self.handle_book(rest, now));
        }
        if let Some(rest) =
            strip_prefix_ci(message, "text ").or_else(|| strip_prefix_ci(message, "sms "))
        {
            return Some(self.handle_text(rest));
        }
        if lower == "status" {
            return Some(self.handle_status());
        }
        if lower == "help" {
            return Some(CommandAction::Reply(
                "Commands:\ncall [name] and [task]\nbook [name] for [time]\ntext [name] [msg]\nstatus"
                    .to_owned(),
            ));
        }

        self.handle_natural(message, now)
    }

    /// `call [contact] and [objective]`
    fn handle_call(&self, args: &str) -> CommandAction {
        let (contact_query, objective) = match self.call_re.captures(args) {
            Some(caps) => (
                caps[1].trim().to_owned(),
                Some(caps[2].trim().to_owned()),
            ),
            None => (args.trim().to_owned(), None),
        };

        let Some(lead) = self.find_contact(&contact_query) else {
            return CommandAction::Reply(format!("Contact '{contact_query}' not found"));
        };
        let phone = PhoneNumber::normalize(&lead.phone);
        if phone.is_empty() {
            return CommandAction::Reply(format!("No phone number for {}", lead.full_name()));
        }

        let contact_name = lead.full_name();
        let objective =
            objective.unwrap_or_else(|| format!("Follow up call with {contact_name}"));

        info!("command: call {contact_name}, objective '{objective}'");
        let reply = format!(
            "Calling {contact_name} at {}. Objective: {objective}",
            lead.phone
        );
        CommandAction::QueueCall {
            job: PendingCall {
                phone,
                objective,
                lead_id: Some(lead.id),
                contact_name,
                agent_id: "personal_assistant".to_owned(),
            },
            reply,
        }
    }

    /// `book [contact] for [date/time]`
    fn handle_book(&self, args: &str, now: NaiveDateTime) -> CommandAction {
        let Some(caps) = self.book_re.captures(args) else {
            return CommandAction::Reply("Format: book [contact] for [date/time]".to_owned());
        };
        let contact_query = caps[1].trim().to_owned();
        let datetime_text = caps[2].trim().to_owned();

        let Some(lead) = self.find_contact(&contact_query) else {
            return CommandAction::Reply(format!("Contact '{contact_query}' not found"));
        };
        let Some(when) = self.parse_datetime(&datetime_text, now) else {
            return CommandAction::Reply(format!(
                "Could not understand date/time: {datetime_text}"
            ));
        };

        // Calendar integrations are configured out of band; the command
        // still validates so the owner gets a precise answer.
        CommandAction::Reply(format!(
            "No calendar provider configured to book {} for {}",
            lead.full_name(),
            when.format("%A %m/%d at %I:%M %p")
        ))
    }

    /// `text [contact] [message]`
    fn handle_text(&self, args: &str) -> CommandAction {
        let Some((contact_query, body)) = args.split_once(' ') else {
            return CommandAction::Reply("Format: text [contact] [message]".to_owned());
        };

        let Some(lead) = self.find_contact(contact_query) else {
            return CommandAction::Reply(format!("Contact '{contact_query}' not found"));
        };
        let phone = PhoneNumber::normalize(&lead.phone);
        if phone.is_empty() {
            return CommandAction::Reply(format!("No phone number for {}", lead.full_name()));
        }

        CommandAction::SendSms {
            to: phone,
            body: body.trim().to_owned(),
            reply: format!("Texting {}", lead.full_name()),
        }
    }

    fn handle_status(&self) -> CommandAction {
        let total = self.store.lead_count().unwrap_or(0);
        CommandAction::Reply(format!("Leads: {total}"))
    }

    /// Natural-language fallbacks for common phrasings.
    fn handle_natural(&self, message: &str, now: NaiveDateTime) -> Option<CommandAction> {
        if let Some(caps) = self.remind_re.captures(message) {
            let contact = &caps[1];
            let topic = &caps[2];
            return Some(self.handle_call(&format!("{contact} and remind them about {topic}")));
        }
        if let Some(caps) = self.schedule_call_re.captures(message) {
            return Some(self.handle_call(&caps[1]));
        }
        if let Some(caps) = self.meeting_re.captures(message) {
            return Some(self.handle_book(&format!("{} for {}", &caps[1], &caps[2]), now));
        }
        None
    }

    /// Resolve a contact: exact first name, then full name, then the best
    /// search hit.
    fn find_contact(&self, query: &str) -> Option<Lead> {
        let query = query.trim().to_lowercase();
        let leads = self.store.search_leads(&query, 10).ok()?;
        if leads.is_empty() {
            return None;
        }

        if let Some(lead) = leads
            .iter()
            .find(|l| l.first_name.to_lowercase() == query)
        {
            return Some(lead.clone());
        }
        if let Some(lead) = leads
            .iter()
            .find(|l| l.full_name().to_lowercase() == query)
        {
            return Some(lead.clone());
        }
        leads.into_iter().next()
    }

    /// Parse `today|tomorrow|<weekday>` plus `H[:MM][am|pm]`, defaulting
    /// to 10:00.
    #[must_use]
    pub fn parse_datetime(&self, text: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let lower = text.to_lowercase();

        let target_date = if lower.contains("today") {
            now.date()
        } else if lower.contains("tomorrow") {
            now.date() + ChronoDuration::days(1)
        } else if let Some(weekday) = find_weekday(&lower) {
            let mut days_ahead =
                i64::from(weekday.num_days_from_monday()) - i64::from(now.weekday().num_days_from_monday());
            if days_ahead <= 0 {
                days_ahead += 7;
            }
            now.date() + ChronoDuration::days(days_ahead)
        } else {
            now.date()
        };

        let (hour, minute) = match self.time_re.captures(&lower) {
            Some(caps) => {
                let mut hour: u32 = caps[1].parse().ok()?;
                let minute: u32 = caps
                    .get(2)
                    .map(|m| m.as_str().parse().unwrap_or(0))
                    .unwrap_or(0);
                match caps.get(3).map(|m| m.as_str()) {
                    Some("pm") if hour < 12 => hour += 12,
                    Some("am") if hour == 12 => hour = 0,
                    _ => {}
                }
                (hour, minute)
            }
            None => (10, 0),
        };

        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        Some(target_date.and_time(time))
    }
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

fn find_weekday(text: &str) -> Option<Weekday> {
    const DAYS: [(&str, Weekday); 7] = [
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    DAYS.iter()
        .find(|(name, _)| text.contains(name))
        .map(|(_, day)| *day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

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

    fn wednesday_9am() -> NaiveDateTime {
        // 2024-06-05 was a Wednesday.
        NaiveDate::from_ymd_opt(2024, 6, 5)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn call_command_queues_with_objective() {
        let handler = CommandHandler::new(store_with_john());
        let action = handler
            .interpret("call john and remind him about the meeting tomorrow", wednesday_9am())
            .expect("recognized");

        match action {
            CommandAction::QueueCall { job, reply } => {
                assert_eq!(job.phone.digits(), "17025551234");
                assert_eq!(job.contact_name, "John Doe");
                assert!(job.objective.contains("remind"));
                assert!(job.objective.contains("tomorrow"));
                assert!(reply.contains("John Doe"));
            }
            other => panic!("expected QueueCall, got {other:?}"),
        }
    }

    #[test]
    fn call_without_objective_gets_a_default() {
        let handler = CommandHandler::new(store_with_john());
        let action = handler.interpret("call john", wednesday_9am()).unwrap();
        match action {
            CommandAction::QueueCall { job, .. } => {
                assert!(job.objective.contains("Follow up"));
            }
            other => panic!("expected QueueCall, got {other:?}"),
        }
    }

    #[test]
    fn unknown_contact_reports_not_found() {
        let handler = CommandHandler::new(store_with_john());
        let action = handler
            .interpret("call cthulhu and say hi", wednesday_9am())
            .unwrap();
        match action {
            CommandAction::Reply(reply) => assert!(reply.contains("not found")),
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn text_command_resolves_contact_and_body() {
        let handler = CommandHandler::new(store_with_john());
        let action = handler
            .interpret("text john running 10 minutes late", wednesday_9am())
            .unwrap();
        match action {
            CommandAction::SendSms { to, body, .. } => {
                assert_eq!(to.digits(), "17025551234");
                assert_eq!(body, "running 10 minutes late");
            }
            other => panic!("expected SendSms, got {other:?}"),
        }
    }

    #[test]
    fn status_and_help_reply_directly() {
        let handler = CommandHandler::new(store_with_john());
        match handler.interpret("status", wednesday_9am()).unwrap() {
            CommandAction::Reply(reply) => assert_eq!(reply, "Leads: 1"),
            other => panic!("{other:?}"),
        }
        match handler.interpret("help", wednesday_9am()).unwrap() {
            CommandAction::Reply(reply) => assert!(reply.contains("call [name]")),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn natural_remind_phrasing_becomes_a_call() {
        let handler = CommandHandler::new(store_with_john());
        let action = handler
            .interpret("remind john about the invoice", wednesday_9am())
            .unwrap();
        match action {
            CommandAction::QueueCall { job, .. } => {
                assert!(job.objective.contains("invoice"));
            }
            other => panic!("expected QueueCall, got {other:?}"),
        }
    }

    #[test]
    fn non_commands_fall_through_to_the_ai() {
        let handler = CommandHandler::new(store_with_john());
        assert!(handler
            .interpret("what's on my schedule this week?", wednesday_9am())
            .is_none());
    }

    #[test]
    fn datetime_parsing_rules() {
        let handler = CommandHandler::new(store_with_john());
        let now = wednesday_9am();

        let tomorrow_4pm = handler.parse_datetime("tomorrow at 4pm", now).unwrap();
        assert_eq!(tomorrow_4pm.day(), 6);
        assert_eq!(tomorrow_4pm.hour(), 16);

        // "tuesday" from a Wednesday means next week's Tuesday.
        let tuesday = handler.parse_datetime("tuesday at 4", now).unwrap();
        assert_eq!(tuesday.weekday(), Weekday::Tue);
        assert_eq!(tuesday.day(), 11);
        assert_eq!(tuesday.hour(), 4);

        // No time given: default 10:00.
        let today = handler.parse_datetime("today", now).unwrap();
        assert_eq!(today.hour(), 10);
        assert_eq!(today.minute(), 0);

        let half_past = handler.parse_datetime("today at 2:30 pm", now).unwrap();
        assert_eq!(half_past.hour(), 14);
        assert_eq!(half_past.minute(), 30);

        let midnight = handler.parse_datetime("tomorrow at 12am", now).unwrap();
        assert_eq!(midnight.hour(), 0);
    }

    #[test]
    fn book_reports_missing_calendar_with_parsed_slot() {
        let handler = CommandHandler::new(store_with_john());
        let action = handler
            .interpret("book john for tuesday at 4pm", wednesday_9am())
            .unwrap();
        match action {
            CommandAction::Reply(reply) => {
                assert!(reply.contains("No calendar provider"));
                assert!(reply.contains("John Doe"));
                assert!(reply.contains("Tuesday"));
                assert!(reply.contains("04:00 PM"));
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }
}
