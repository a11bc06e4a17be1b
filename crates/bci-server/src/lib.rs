//! BCI-Server: Broadcast hub and acquisition session
//!
//! Fans pipeline messages out to WebSocket subscribers and wires the device,
//! the pipeline and the hub into one session with an explicit lifecycle.

pub mod config;
pub mod hub;
pub mod subscriber;
pub mod ws;
pub mod session;

pub use config::{HubConfig, ServerConfig};
pub use hub::{Hub, HubHandle, SubscriberId, Subscription};
pub use subscriber::{run_subscriber, DeliverySettings, SubscriberSink};
pub use ws::{router, AppState};
pub use session::Session;
