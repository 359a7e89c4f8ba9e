//! Cachet wire types.
//!
//! DTOs exchanged between clients and the server: key bundles, message
//! envelopes, attachment upload/download shapes and device registration.
//! Everything here serializes to camelCase JSON; byte fields are
//! base64-encoded strings on the wire.
//!
//! The server treats all `content` fields as opaque bytes. Types that are
//! only ever seen *inside* an encrypted payload (attachment pointers, the
//! message payload itself) also live here because both ends of a
//! conversation must agree on their encoding, but the server never parses
//! them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod address;
pub mod attachment;
pub mod b64;
pub mod device;
pub mod envelope;
pub mod keys;
pub mod payload;

pub use address::DeviceAddress;
pub use attachment::{AttachmentPointer, CompleteUploadResponse, InitiateUploadResponse};
pub use device::{DeviceInfo, RegisterDeviceRequest};
pub use envelope::{AcknowledgeRequest, EnvelopeType, QueuedEnvelope, SubmitEnvelope};
pub use keys::{
    KeyBundleResponse, KeyBundleUpload, OneTimePreKeyPublic, PreKeyCountResponse,
    ReplenishRequest, SignedPreKeyPublic,
};
pub use payload::MessagePayload;
