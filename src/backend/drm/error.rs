//! Errors of the drm backend

use drm::control::{crtc, Mode, RawResourceHandle};
use std::{io, path::PathBuf};

/// A failed kernel access, with the device it happened on
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Errors thrown by the [`DrmPipeline`](crate::backend::drm::DrmPipeline),
/// the [`DrmOutput`](crate::backend::drm::DrmOutput) and the [`DrmBackend`](crate::backend::drm::DrmBackend).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Device is currently paused
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// Mode is not in the list of modes advertised by the connector
    #[error("Mode `{0:?}` is not compatible with the connector")]
    ModeNotSuitable(Mode),
    /// The connector is not known to this device
    #[error("Unknown connector")]
    UnknownConnector,
    /// The crtc is not known to this device
    #[error("Unknown crtc")]
    UnknownCrtc,
    /// The plane is not known to this device
    #[error("Unknown plane")]
    UnknownPlane,
    /// The object is missing a required property
    #[error("The DrmDevice is missing a required property '{name}' for handle ({handle:?})")]
    UnknownProperty {
        /// Property handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// The connector has no monitor attached
    #[error("Connector is disconnected")]
    ConnectorDisconnected,
    /// No free crtc is able to drive the connector
    #[error("No free crtc can drive the connector")]
    NoSuitableCrtc,
    /// The requested configuration is structurally invalid
    #[error("Invalid output configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// The gamma ramp does not match the size advertised by the crtc
    #[error("Gamma ramp of size {got} does not match crtc gamma size {expected}")]
    GammaSizeMismatch {
        /// Size advertised by the crtc
        expected: usize,
        /// Size of the provided ramp
        got: usize,
    },
    /// Atomic Test failed for new properties
    #[error("Atomic Test failed for new properties on crtc ({0:?})")]
    TestFailed(crtc::Handle),
    /// The kernel rejected the commit
    #[error("Atomic commit on crtc ({crtc:?}) was rejected ({source})")]
    CommitRejected {
        /// Crtc the commit was issued for
        crtc: crtc::Handle,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
    /// A commit is already in flight for this crtc
    #[error("A commit is already pending on crtc ({0:?})")]
    FlipPending(crtc::Handle),
    /// The framebuffer is referenced by a crtc or plane and cannot be written
    #[error("Framebuffer is currently scanned out")]
    BufferBusy,
    /// The framebuffer handle is stale or unknown
    #[error("Unknown or already released framebuffer")]
    UnknownFramebuffer,
    /// The swapchain has no free slot left
    #[error("No free buffer available in the swapchain")]
    NoFreeSlots,
    /// The kernel object no longer exists
    #[error("The kernel object no longer exists")]
    ObjectGone,
    /// No frame was rendered since the last present
    #[error("No rendered frame to present")]
    NoRenderedFrame,
    /// The output is disabled or powered off
    #[error("Output is disabled")]
    OutputDisabled,
}

impl Error {
    /// Returns true if the error indicates the device or object went away
    pub fn is_device_lost(&self) -> bool {
        match self {
            Error::ObjectGone => true,
            Error::Access(AccessError { source, .. }) | Error::CommitRejected { source, .. } => {
                matches!(source.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENOENT))
            }
            _ => false,
        }
    }
}

/// Shorthand for building an [`AccessError`] out of an io error
pub(crate) fn access(errmsg: &'static str, dev: Option<PathBuf>) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Access(AccessError { errmsg, dev, source })
}
