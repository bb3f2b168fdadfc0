//! SMS command channel and multi-agent dispatch.

pub mod commands;
pub mod personas;
pub mod router;
pub mod tools;

pub use personas::{AgentKind, AgentPersona, PersonaRegistry};
pub use router::SmsRouter;
pub use tools::{PendingCall, SearchResult, ToolExecutor, WebSearch};
