//! Wire Protocol
//!
//! Every bus subject carries a single JSON document per message, with a
//! closed type per subject. The gateway, engine and key service all
//! speak the types in this crate; nothing else crosses the bus.

pub mod bus;
pub mod messages;
pub mod signaling;
pub mod subjects;

pub use bus::{BusClient, BusError};
pub use messages::*;
pub use signaling::{SignalEnvelope, SignalKind, SignalRole};

use std::fmt;

/// End-to-end trace key: `device_id/frame_id`.
pub struct Trace<'a>(pub &'a str, pub u64);

impl fmt::Display for Trace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_formats_device_and_frame() {
        assert_eq!(Trace("capture-01", 42).to_string(), "capture-01/42");
    }
}
