//! Event fabric for the AudioScribe core.
//!
//! Every producer (queue, scheduler, worker supervision) publishes
//! [`SystemEvent`]s into a single channel; one dispatch task fans them out
//! to subscribers. Publishers never block on slow subscribers, and
//! subscriber callbacks run on the dispatch task, so they must be cheap —
//! push into your own channel if you need to do real work. Delivery is
//! best-effort.

mod bus;
mod event;
mod recheck;

pub use bus::{EventBus, Subscriber};
pub use event::{DownloadProgress, LogMessage, SystemEvent, TaskUpdate};
pub use recheck::RecheckSignal;
