//! Match placement and the global simulation driver

pub mod service;

pub use service::{EnqueueError, Matchmaker};
