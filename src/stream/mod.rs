//! Frame streaming between the peers
//!
//! - [`SendLoop`] samples the local camera and publishes frames
//! - [`ReceiveLoop`] consumes the peer's frames and keeps the view selector
//!   and subscriber healthy

pub mod receiver;
pub mod sender;
pub mod view;

pub use receiver::ReceiveLoop;
pub use sender::{SendLoop, SendStep, SendTiming};
pub use view::{StaleRemote, View, ViewSelector};
