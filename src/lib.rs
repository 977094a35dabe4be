//! Intake Chat — client-side session/message synchronization for a
//! conversational intake service.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod progress;
pub mod push;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ClientConfig, ReconnectPolicy};
pub use engine::{ChatEngine, ChatSnapshot, EnginePhase};
pub use error::{Error, Result};
pub use push::{ChannelState, PushChannel};
pub use transport::{RestClient, SessionApi};
