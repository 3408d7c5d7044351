//! Control-plane coordination.
//!
//! The node registers with the control plane at startup, re-pings it from the
//! refresh loop to keep its origin assignment current, and sends a stop
//! notice when it begins draining.

pub mod assignment;
pub mod control;
pub mod release;

pub use assignment::{ServerAssignment, TlsCredentials};
pub use control::ControlPlaneClient;
