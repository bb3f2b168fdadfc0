//! Owner settings: who the agent works for and how it answers.
//!
//! Persona and greeting strings support `{PLACEHOLDER}` substitution from
//! the scalar settings and from looked-up lead fields, so one template
//! serves every caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{AgentError, Result};

/// Owner-facing settings, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The owner's display name.
    #[serde(rename = "MY_NAME")]
    pub my_name: String,
    /// The owner's reachable number for callbacks and SMS summaries.
    #[serde(rename = "CALLBACK_NUMBER")]
    pub callback_number: String,
    /// Company name used in personas.
    #[serde(rename = "COMPANY")]
    pub company: String,
    /// City used in personas and default tool locations.
    #[serde(rename = "CITY")]
    pub city: String,
    /// Inbound call handling.
    pub incoming: IncomingSettings,
    /// API keys by provider name.
    pub api_keys: BTreeMap<String, String>,
    /// Third-party integration credentials (calendar provider etc.).
    pub integrations: BTreeMap<String, String>,
}

/// Inbound call handling settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingSettings {
    /// Answer incoming calls at all.
    #[serde(rename = "ENABLED")]
    pub enabled: bool,
    /// Persona prompt for the answering agent. Supports placeholders.
    #[serde(rename = "PERSONA")]
    pub persona: String,
    /// Greeting spoken immediately after answering. Supports placeholders.
    #[serde(rename = "GREETING")]
    pub greeting: String,
    /// Text the owner a summary after each inbound call.
    #[serde(rename = "SMS_ENABLED")]
    pub sms_enabled: bool,
}

impl Settings {
    /// Load settings from a JSON file, or defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    /// Scalar settings as substitution pairs.
    #[must_use]
    pub fn placeholder_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("MY_NAME".to_owned(), self.my_name.clone()),
            ("CALLBACK_NUMBER".to_owned(), self.callback_number.clone()),
            ("COMPANY".to_owned(), self.company.clone()),
            ("CITY".to_owned(), self.city.clone()),
        ]
    }

    /// Substitute `{KEY}` placeholders from the scalar settings plus any
    /// extra pairs (typically lead fields for the current caller).
    #[must_use]
    pub fn substitute(&self, template: &str, extra: &[(String, String)]) -> String {
        let mut out = template.to_owned();
        for (key, value) in self.placeholder_pairs().iter().chain(extra.iter()) {
            let placeholder = format!("{{{key}}}");
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            my_name: "Alex".to_owned(),
            callback_number: "17025550000".to_owned(),
            company: "Acme".to_owned(),
            city: "Las Vegas".to_owned(),
            ..Settings::default()
        }
    }

    #[test]
    fn substitutes_scalar_placeholders() {
        let s = settings();
        assert_eq!(
            s.substitute("Hi, this is {MY_NAME}'s assistant at {COMPANY}.", &[]),
            "Hi, this is Alex's assistant at Acme."
        );
    }

    #[test]
    fn extra_pairs_cover_lead_fields() {
        let s = settings();
        let extra = vec![("CALLER_NAME".to_owned(), "John Doe".to_owned())];
        assert_eq!(
            s.substitute("Caller: {CALLER_NAME} ({CITY})", &extra),
            "Caller: John Doe (Las Vegas)"
        );
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let s = settings();
        assert_eq!(s.substitute("{NOT_A_KEY}", &[]), "{NOT_A_KEY}");
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = Settings::load(&dir.path().join("settings.json")).expect("load");
        assert!(!s.incoming.enabled);
        assert!(s.my_name.is_empty());
    }

    #[test]
    fn roundtrips_section_keys() {
        let json = r#"{
            "MY_NAME": "Alex",
            "incoming": {"ENABLED": true, "GREETING": "Hi, {MY_NAME} here", "SMS_ENABLED": true}
        }"#;
        let s: Settings = serde_json::from_str(json).expect("parse");
        assert!(s.incoming.enabled);
        assert!(s.incoming.sms_enabled);
        assert_eq!(s.substitute(&s.incoming.greeting, &[]), "Hi, Alex here");
    }
}
