//! Ringline: AI phone agent over a cellular modem.
//!
//! Places and answers voice calls through a SIM7600-class USB modem, runs
//! the spoken conversation through a local speech pipeline, and takes
//! commands from a privileged owner number over SMS.
//!
//! # Architecture
//!
//! A call flows through independent pieces joined at the audio boundary:
//! - **Modem controller**: AT commands over USB bulk endpoints; the call
//!   state machine and SMS send/receive
//! - **Audio router**: full-duplex host audio devices bridging the
//!   modem's audio jack, converted to 24kHz at the edge via `cpal`
//! - **VAD**: energy-gated utterance detection
//! - **Tone detectors**: Goertzel ringback tracking and FFT
//!   call-progress/DTMF classification
//! - **Conversation engine**: VAD -> STT -> LLM -> TTS with strict
//!   turn-taking and echo suppression
//! - **Call agent**: one outbound or inbound call lifecycle, call logs
//!   and recordings
//! - **SMS router**: owner commands and multi-agent text dispatch

pub mod agent;
pub mod audio;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod knowledge;
pub mod modem;
pub mod models;
pub mod phone;
pub mod settings;
pub mod sms;
pub mod store;
pub mod vad;

pub use agent::{CallAgent, CallRequest, CallResult};
pub use config::AgentConfig;
pub use engine::{ConversationEngine, ConversationState};
pub use error::{AgentError, Result};
pub use modem::ModemController;
pub use phone::PhoneNumber;
pub use settings::Settings;
pub use sms::SmsRouter;
