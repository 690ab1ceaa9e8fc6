//! Shared key/value store for the herald admission engine.
//!
//! Every piece of fleet-wide state (throttle window counters, backoff markers,
//! distribution tallies and lock markers) goes through [`SharedStore`]. Each
//! trait method is a single atomic operation on the backend so concurrent
//! callers never read-modify-write from the client side.
//!
//! Backends:
//! - [`MemoryStore`]: one process, one mutex, clock-driven TTLs
//! - [`RedisStore`]: pooled multiplexed connections, Lua scripts for the
//!   compound operations

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;

pub use backends::{MemoryStore, RedisStore};
pub use config::{MemoryConfig, OpenedStore, RedisConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use r#trait::{LimitCheck, SharedStore, WindowCounter};
