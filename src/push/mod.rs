//! Push channel — live server-to-client event delivery.

pub mod channel;
pub mod connector;
pub mod listeners;

pub use channel::{ChannelState, PushChannel};
pub use connector::{PushConnector, PushStream, WsConnector};
pub use listeners::{Listener, ListenerHandle, ListenerRegistry};
