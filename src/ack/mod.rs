//! At-least-once acknowledgment tracking.
//!
//! Every envelope queued in at-least-once mode gets a pending entry and a
//! timer. When the timer fires before an acknowledgment arrives, the
//! envelope is queued again under the same id and the timer re-armed at the
//! full timeout. Entries end when acknowledged, when their subscriber is
//! gone, or (if configured) when the attempt limit is reached.

mod scheduler;
mod tracker;

pub(crate) use tracker::{AckSettings, AckTracker, DeliverError};
