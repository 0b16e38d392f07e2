//! Atomic kernel modesetting
//!
//! This module drives displays through the atomic drm api. Every configuration change,
//! frame and cursor update becomes exactly one atomic commit that the kernel either
//! applies completely or rejects, in which case nothing changes on our side either.
//!
//! ## Structure
//!
//! - [`KmsDevice`] is everything we need from the kernel. [`DrmDeviceFd`] implements it
//!   for a real drm node, [`TestDevice`](device::test::TestDevice) in memory.
//! - [`Crtc`], [`Plane`] and [`Connector`] wrap the kernel objects. Each of them owns a
//!   [`DrmObject`], a cache of its property values, which only changes once a commit
//!   touching it succeeded.
//! - [`DrmPipeline`] binds a connector to a crtc and its planes. It keeps the *active*
//!   state acknowledged by the kernel, the *queued* state requested by the user and the
//!   *pending* state of the commit in flight. There is at most one commit in flight.
//! - [`DrmOutput`] sits on top of a pipeline and handles what users actually ask for:
//!   [`OutputConfiguration`]s, frames, power states and cursors.
//! - [`DrmGpu`] owns the objects of one device and the outputs of its connectors,
//!   [`DrmBackend`] owns all gpus and reports [`OutputEvent`]s.
//!
//! ## Framebuffers
//!
//! Framebuffers are tracked in an arena ([`Framebuffers`]) and referred to by
//! [`FramebufferId`]. Crtcs and planes hold them in a `current` and a `next` slot. `next`
//! is only filled after the kernel accepted a commit and is promoted to `current` on the
//! page-flip. A framebuffer is destroyed once neither its swapchain nor any slot uses it.
//!
//! ## Page-flips
//!
//! Commits that change what is on screen request a page-flip event. Feed those events
//! back through [`DrmBackend::on_page_flip`], either from a [`DrmDeviceNotifier`]
//! inserted into your event loop or by calling [`DrmBackend::dispatch_device_events`]
//! when the device fd becomes readable:
//!
//! ```rust,ignore
//! let notifier = DrmDeviceNotifier::new(device.clone());
//! let gpu = backend.add_gpu(device)?;
//! event_loop.handle().insert_source(notifier, move |event, metadata, state| match event {
//!     DrmEvent::VBlank(crtc) => {
//!         if let Some(metadata) = metadata {
//!             state.backend.on_page_flip(gpu, crtc, *metadata);
//!         }
//!     }
//!     DrmEvent::Error(err) => tracing::error!(?err, "drm device error"),
//! })?;
//! ```
//!
//! Until the page-flip of a commit arrived, further frames are rejected with
//! [`Error::FlipPending`] and configuration changes are deferred.

use std::time::Duration;

pub(crate) mod backend;
pub(crate) mod color;
pub(crate) mod commit;
pub(crate) mod connector;
pub(crate) mod crtc;
pub mod device;
pub(crate) mod error;
pub(crate) mod framebuffer;
pub(crate) mod gpu;
pub(crate) mod object;
pub(crate) mod output;
pub(crate) mod pipeline;
pub(crate) mod plane;
pub(crate) mod scanner;
pub(crate) mod swapchain;

pub use self::backend::{DrmBackend, GpuId, OutputEvent, OutputId};
pub use self::color::{ColorTransform, GammaRamp};
pub use self::commit::{AtomicCommit, CommitMode, PropertyWrite};
pub use self::connector::Connector;
pub use self::crtc::Crtc;
#[cfg(feature = "backend_drm")]
pub use self::device::{DrmDeviceFd, DrmDeviceNotifier};
pub use self::device::{ConnectorInfo, DeviceResources, KmsDevice, PageFlip, PlaneInfo, PropertyValue};
pub use self::error::{AccessError, Error};
pub use self::framebuffer::{BufferSlots, Framebuffer, FramebufferId, Framebuffers};
pub use self::gpu::{DrmGpu, KmsObjects};
pub use self::object::{DrmObject, ObjectId};
pub use self::output::{
    CursorImage, DpmsMode, DrmOutput, FlipOutcome, OutputConfiguration, OutputLayer, OutputMode,
};
pub use self::pipeline::{ApplyOutcome, ChangeFlags, CommitKind, CursorState, DrmPipeline, PipelineState};
pub use self::plane::{DrmRotation, Plane, PlaneConfig};
pub use self::scanner::{ConnectorScanResult, ConnectorScanner, CrtcMapper};
pub use self::swapchain::{RenderTarget, Swapchain};

pub use drm::control::PlaneType;

/// Events generated by a [`DrmDeviceNotifier`]
#[derive(Debug)]
pub enum DrmEvent {
    /// A vblank blank event on the provided crtc has happened
    VBlank(drm::control::crtc::Handle),
    /// An error happened while processing events
    Error(Error),
}

/// Timing metadata for page-flip events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMetadata {
    /// The time the frame flip happened, on the clock of the kernel
    pub time: Duration,
    /// The sequence number of the frame
    pub sequence: u32,
}
