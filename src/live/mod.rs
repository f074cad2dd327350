//! Live fan-out to websocket subscribers
//!
//! - `hub`: `BroadcastHub` connection/topic index and delivery
//! - `loops`: per-topic event, odds and metric loops
//! - `invalidation`: best-effort page revalidation
//! - `messages`: wire format

pub mod hub;
pub mod invalidation;
pub mod loops;
pub mod messages;

pub use hub::{BroadcastHub, BroadcastReport, ConnectionId, Frame, HubError, TopicDriver};
pub use invalidation::{InvalidationError, Revalidator};
pub use loops::{event_channel, odds_key, LiveLoops, OddsWatch};
pub use messages::{ClientMessage, LiveMessage};
