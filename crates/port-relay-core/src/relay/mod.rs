//! Non-blocking relay engine.
//!
//! A [`RelayInstance`] owns one listening port and one readiness event loop.
//! Every accepted connection is paired with an outbound connection to the
//! instance's remote, and bytes are pumped in both directions through
//! fixed-size [`RelayBuffer`]s.

pub mod buffer;
mod instance;
pub mod state;

pub use buffer::{RelayBuffer, BUFFER_SIZE};
pub use instance::{RelayInstance, POLL_TIMEOUT};
pub use state::{Flow, RelayState};
