//! Subscription registry and subscriber channels.
//!
//! Every subscription is a bounded FIFO channel attached to exactly one
//! topic. Publishers never block on it: a full channel rejects the frame.
//! Closing happens through `unsubscribe` or by dropping the handle. After
//! an unsubscribe the receiver drains whatever is queued and then
//! disconnects.
//!
//! # Example
//!
//! ```ignore
//! let handle = broker.subscribe("sports", None)?;
//!
//! for frame in handle.iter() {
//!     println!("{} bytes", frame.bytes().len());
//! }
//! ```

mod registry;
mod types;

pub(crate) use registry::SubscriptionRegistry;
pub(crate) use types::{Rejection, SubscriberChannel};
pub use types::{Delivery, ReplaySummary, SubscriptionHandle};
