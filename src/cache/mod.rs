//! Resilient caching in front of the shared KV/pub-sub store.
//!
//! - `ResilientCache`: dual-backend get/set/delete with circuit breaking
//! - `LocalStore`: bounded in-process fallback with lazy expiry
//! - `codec`: tagged JSON/MessagePack payload encoding
//! - `RemoteStore`: the remote seam (`InProcessStore`, `RedisStore`)

pub mod circuit;
pub mod codec;
pub mod local;
pub mod remote;
pub mod resilient;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use circuit::{CircuitBreaker, CircuitState};
pub use codec::{CodecError, Encoding};
pub use local::{glob_match, LocalStore};
pub use remote::{InProcessStore, MessageStream, RemoteError, RemoteStore};
pub use resilient::{CacheMetrics, ResilientCache};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
