//! Cachet server services.
//!
//! Everything the server does with content it cannot read: the device
//! registry, the key bundle directory, the envelope transport queue and
//! the resumable attachment store, plus the retention sweeper that drives
//! their expiry. The services are handles over shared state; a deployment
//! wires them to its listener, and [`LoopbackTransport`] wires them
//! directly to an in-process client engine.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod attachments;
pub mod clock;
pub mod devices;
pub mod directory;
pub mod error;
pub mod loopback;
pub mod queue;
pub mod sweeper;

pub use attachments::{ATTACHMENT_TTL_SECS, AttachmentStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use devices::DeviceRegistry;
pub use directory::KeyDirectory;
pub use error::ServerError;
pub use loopback::LoopbackTransport;
pub use queue::{ENVELOPE_TTL_SECS, EnvelopeQueue, QueueConfig};
pub use sweeper::{SweepReport, Sweeper};
