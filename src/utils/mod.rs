//! Shared helpers

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, check_tcp_port, local_addresses, resolve, InterfaceAddr};
pub use throttle::LogThrottler;
