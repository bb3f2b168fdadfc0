//! In-band signal analysis: ringback and call-progress tone detection.

pub mod goertzel;
pub mod ringback;
pub mod tones;

pub use goertzel::goertzel_magnitude;
pub use ringback::{RingbackDetector, RingbackStatus};
pub use tones::{ToneDetector, ToneKind, ToneReport};
