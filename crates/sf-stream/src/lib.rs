//! Append-only per-run event streaming.
//!
//! The [`log::EventLog`] is the single consistency point between the
//! orchestrator (producer) and stream subscribers (consumers): events get a
//! per-run monotonic id at publish time, stay readable from any offset, and
//! can be tailed live. The [`subscriber`] module layers the wire protocol on
//! top: a `connected` frame, full-history replay, live tailing, and
//! keepalive heartbeats that never occupy event ids.

pub mod event;
pub mod log;
pub mod subscriber;

pub use event::{Event, EventType};
pub use log::{EventLog, TailFrom, Tailer};
pub use subscriber::{subscribe, StreamFrame};
