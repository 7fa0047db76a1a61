//! Client for the speech and avatar synthesis service.
//!
//! The service exposes `POST /tts/synthesize` and `POST /avatar/render`, both
//! answering with the raw media bytes.

pub mod client;
pub mod error;
pub mod types;

pub use client::{SynthBackend, SynthClient, SynthClientConfig};
pub use error::{SynthError, SynthResult};
pub use types::{AvatarRequest, SynthesizedMedia, TtsRequest};
