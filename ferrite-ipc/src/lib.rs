//! Synchronous, capability-gated inter-process communication.
//!
//! Builds directly on `ferrite-sched`'s [`ferrite_sched::sched::Scheduler`]
//! for the actual thread suspend/resume; this crate only adds the
//! rendezvous protocol, the message shape, capability spaces, and
//! notification objects on top. Host-testable like the rest of the
//! workspace — nothing here is architecture-specific.

#![cfg_attr(target_os = "none", no_std)]

pub mod capability;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod notification;

pub use capability::{CapKind, Capability, CapabilitySpace, Rights};
pub use endpoint::{Endpoint, EndpointFlags};
pub use error::IpcError;
pub use message::{Message, MessageFlags, MessageTag};
pub use notification::Notification;
