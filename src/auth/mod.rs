//! Token lifecycle guards.

mod replay;

pub use replay::BoundedReplayTracker;
