//! Operator tools: network diagnostics and a live link probe

pub mod diagnostics;
pub mod probe;

pub use diagnostics::{run_diagnostics, DiagnosticsReport};
pub use probe::{run_probe, ProbeReport};
