//! Server-side error types.

use cachet_proto::DeviceAddress;
use thiserror::Error;

/// Errors from the server services.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The addressed device is not registered, or has been revoked.
    #[error("unknown or inactive device {0}")]
    UnknownDevice(DeviceAddress),

    /// The device has never uploaded a key bundle.
    #[error("no key bundle for {0}")]
    BundleMissing(DeviceAddress),

    /// A submitted batch failed validation; nothing was enqueued.
    #[error("envelope batch rejected: {0}")]
    EnvelopeRejected(String),

    /// The attachment does not exist or is not complete.
    #[error("attachment {0} not found")]
    AttachmentNotFound(u64),

    /// The caller does not own the attachment.
    #[error("not the owner of attachment {0}")]
    Unauthorized(u64),

    /// The attachment was already finalized; its content is immutable.
    #[error("attachment {0} already complete")]
    AlreadyComplete(u64),

    /// Completing an upload that received no chunks.
    #[error("attachment {0} has no chunks")]
    EmptyUpload(u64),

    /// Filesystem failure in the attachment store.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
