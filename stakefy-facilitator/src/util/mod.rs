//! Process-level helpers for the facilitator binary.

mod shutdown;

pub use shutdown::Shutdown;
