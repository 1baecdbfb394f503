pub mod config;
pub mod context;
pub mod error;
pub mod gatekeeper;
pub mod key;
pub mod metrics;
pub mod middleware;
pub mod ratelimit;

pub use gatekeeper::{Gatekeeper, admit};
