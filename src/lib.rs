//! twinview - symmetric peer video mirror
//!
//! Two devices publish their own camera frame (plus a detected people
//! count) to each other and show whichever view is live. An LED worker
//! runs in a separate, supervised process so a crashing pixel driver
//! never takes the media path down with it.

pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod stream;
pub mod tools;
pub mod transport;
pub mod utils;
pub mod video;
pub mod web;
pub mod wire;
pub mod worker;

pub use error::{AppError, Result};
pub use state::{RunContext, SharedState};
