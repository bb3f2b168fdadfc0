//! Agent personas: who answers, with which model, and which tools.

use crate::models::ModelTier;
use serde::{Deserialize, Serialize};

/// Persona role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// The owner's assistant; full tool access, reasoning-tier model.
    PersonalAssistant,
    /// Answers everyone else; fast model, no tools.
    Receptionist,
    SalesRep,
    Researcher,
}

/// A configured agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPersona {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    pub model_tier: ModelTier,
    /// What this agent is trying to accomplish.
    pub objective: String,
    /// How the agent behaves. Supports `{PLACEHOLDER}` substitution.
    pub persona_prompt: String,
    /// Tool names this agent may invoke.
    pub tools_allowed: Vec<String>,
    /// Knowledge base backing this agent's prompts, if any.
    pub knowledge_base_id: Option<String>,
    pub enabled: bool,
}

impl AgentPersona {
    /// Default personal-assistant persona for the owner.
    #[must_use]
    pub fn personal_assistant() -> Self {
        Self {
            id: "personal_assistant".to_owned(),
            name: "Personal Assistant".to_owned(),
            kind: AgentKind::PersonalAssistant,
            model_tier: ModelTier::Reasoning,
            objective: "Handle requests from your boss quickly and accurately.".to_owned(),
            persona_prompt: "You are {MY_NAME}'s personal assistant at {COMPANY}, based in \
                             {CITY}. You handle their calls, texts, and scheduling. You are \
                             efficient and direct. Use your tools when a request needs them."
                .to_owned(),
            tools_allowed: vec![
                "search_contacts".to_owned(),
                "search_web".to_owned(),
                "get_movie_showtimes".to_owned(),
                "make_call".to_owned(),
                "send_sms".to_owned(),
            ],
            knowledge_base_id: None,
            enabled: true,
        }
    }

    /// Default receptionist persona for everyone else.
    #[must_use]
    pub fn receptionist() -> Self {
        Self {
            id: "receptionist".to_owned(),
            name: "Receptionist".to_owned(),
            kind: AgentKind::Receptionist,
            model_tier: ModelTier::Fast,
            objective: "Take messages and answer basic questions politely.".to_owned(),
            persona_prompt: "You answer texts on behalf of {MY_NAME} at {COMPANY}. Be brief, \
                             warm, and human-sounding. If you don't know something, say you'll \
                             pass the message along."
                .to_owned(),
            tools_allowed: Vec::new(),
            knowledge_base_id: None,
            enabled: true,
        }
    }
}

/// The set of configured personas.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: Vec<AgentPersona>,
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self {
            personas: vec![
                AgentPersona::personal_assistant(),
                AgentPersona::receptionist(),
            ],
        }
    }
}

impl PersonaRegistry {
    /// Build a registry from explicit personas; defaults fill any missing
    /// owner/receptionist role.
    #[must_use]
    pub fn new(mut personas: Vec<AgentPersona>) -> Self {
        if !personas
            .iter()
            .any(|p| p.kind == AgentKind::PersonalAssistant)
        {
            personas.push(AgentPersona::personal_assistant());
        }
        if !personas.iter().any(|p| p.kind == AgentKind::Receptionist) {
            personas.push(AgentPersona::receptionist());
        }
        Self { personas }
    }

    /// The persona answering SMS for this sender class.
    #[must_use]
    pub fn for_sms(&self, is_owner: bool) -> &AgentPersona {
        let kind = if is_owner {
            AgentKind::PersonalAssistant
        } else {
            AgentKind::Receptionist
        };
        self.personas
            .iter()
            .find(|p| p.kind == kind && p.enabled)
            .unwrap_or(&self.personas[0])
    }

    /// Look up a persona by id.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<&AgentPersona> {
        self.personas.iter().find(|p| p.id == id)
    }
}
