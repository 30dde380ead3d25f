//! Duplex publish/subscribe transport between the two peers
//!
//! Each peer binds one [`Publisher`] and runs one [`Subscriber`] against
//! the other peer's publisher. Delivery is best effort: messages sent
//! while nobody is connected are dropped, slow subscribers lose messages
//! instead of slowing the sender, and the subscriber reconnects on its
//! own in the background.

pub mod duplex;
pub mod publisher;
pub mod reconnect;
pub mod subscriber;

pub use duplex::{connect_with_retry, ChannelConfig, DuplexChannel};
pub use publisher::Publisher;
pub use reconnect::ReconnectPolicy;
pub use subscriber::{Subscriber, SubscriberOptions};

use thiserror::Error;

use crate::wire::{FrameMessage, WireError};

/// Transport failures that count toward the reconnect threshold
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] WireError),

    #[error("Framing error: {0}")]
    Framing(#[source] WireError),

    #[error("Connection to {remote} lost: {reason}")]
    Disconnected { remote: String, reason: String },

    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Subscriber task stopped")]
    Closed,
}

/// Outcome of one bounded receive
#[derive(Debug)]
pub enum Received {
    Message(FrameMessage),
    /// Nothing arrived in time; expected while the peer is slow or down
    Timeout,
    Error(TransportError),
}

impl Received {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
