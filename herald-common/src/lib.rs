//! Shared building blocks for the herald workspace.
//!
//! - [`Domain`]: normalized recipient domain newtype
//! - [`clock`]: wall-clock seam used for window arithmetic and TTLs
//! - [`logging`]: subscriber initialisation and the `internal!` family of macros

pub mod clock;
pub mod domain;
pub mod logging;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use domain::Domain;
pub use tracing;

/// Lifecycle signal broadcast to long-running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
