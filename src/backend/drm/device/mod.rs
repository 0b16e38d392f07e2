//! Access to the kernel modesetting interface
//!
//! Everything the pipeline needs from the kernel goes through the [`KmsDevice`] trait.
//! [`DrmDeviceFd`] implements it for a real drm node, [`TestDevice`](test::TestDevice)
//! implements it in memory.

use std::{io, path::PathBuf, time::Duration};

use drm::control::{connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Mode};
use drm_fourcc::DrmFourcc;

use super::{commit::AtomicCommit, object::ObjectId, PlaneType};
use crate::utils::{Physical, Size};

#[cfg(feature = "backend_drm")]
mod fd;
#[cfg(feature = "backend_drm")]
mod notifier;

#[cfg(feature = "backend_drm")]
pub use self::fd::DrmDeviceFd;
#[cfg(feature = "backend_drm")]
pub use self::notifier::DrmDeviceNotifier;

/// Handles of all modesetting resources of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceResources {
    /// Crtcs, in pipe order
    pub crtcs: Vec<crtc::Handle>,
    /// Connectors
    pub connectors: Vec<connector::Handle>,
    /// Planes
    pub planes: Vec<plane::Handle>,
}

/// A property of a kernel object together with its current value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    /// Kernel handle of the property
    pub handle: property::Handle,
    /// Name of the property
    pub name: String,
    /// Raw value
    pub value: u64,
}

/// Connector state as reported by the kernel
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Handle of the connector
    pub handle: connector::Handle,
    /// Name of the connector, e.g. `DP-1`
    pub name: String,
    /// Connection state
    pub state: connector::State,
    /// Supported modes
    pub modes: Vec<Mode>,
    /// Crtcs able to drive this connector
    pub possible_crtcs: Vec<crtc::Handle>,
    /// Physical size in millimeters
    pub physical_size: Option<(u32, u32)>,
    /// The connector drives a head-mounted display or similar
    pub non_desktop: bool,
    /// Crtc currently driving the connector
    pub current_crtc: Option<crtc::Handle>,
}

/// Plane capabilities as reported by the kernel
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// Handle of the plane
    pub handle: plane::Handle,
    /// Type of the plane
    pub kind: PlaneType,
    /// Crtcs the plane can be attached to
    pub possible_crtcs: Vec<crtc::Handle>,
    /// Supported formats
    pub formats: Vec<DrmFourcc>,
}

/// A page-flip completion reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlip {
    /// Crtc that flipped
    pub crtc: crtc::Handle,
    /// Vblank sequence number
    pub sequence: u32,
    /// Timestamp of the flip
    pub time: Duration,
}

/// Kernel modesetting operations used by the pipeline
///
/// Methods take `&self`, as the kernel serializes requests on the device itself.
pub trait KmsDevice: std::fmt::Debug {
    /// Path of the device node, if known
    fn dev_path(&self) -> Option<PathBuf>;

    /// Enumerate crtcs, connectors and planes
    fn resource_handles(&self) -> io::Result<DeviceResources>;

    /// Read all properties of an object
    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertyValue>>;

    /// Read the state of a connector
    fn connector_info(&self, connector: connector::Handle) -> io::Result<ConnectorInfo>;

    /// Read the capabilities of a plane
    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo>;

    /// Read the mode a crtc currently scans out, bypassing any cache
    fn current_mode(&self, crtc: crtc::Handle) -> io::Result<Option<Mode>>;

    /// Maximum size of a cursor plane buffer
    fn cursor_size(&self) -> Size<u32, Physical>;

    /// Upload a mode as a property blob
    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64>;

    /// Upload raw data as a property blob
    fn create_blob(&self, data: &[u8]) -> io::Result<u64>;

    /// Destroy a property blob
    fn destroy_blob(&self, blob: u64) -> io::Result<()>;

    /// Allocate a linear cpu-accessible framebuffer
    fn create_dumb_framebuffer(
        &self,
        size: Size<u32, Physical>,
        format: DrmFourcc,
    ) -> io::Result<framebuffer::Handle>;

    /// Copy pixel data into a framebuffer created by [`KmsDevice::create_dumb_framebuffer`]
    fn write_framebuffer(&self, framebuffer: framebuffer::Handle, data: &[u8]) -> io::Result<()>;

    /// Destroy a framebuffer and its backing memory
    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()>;

    /// Submit an atomic commit
    fn atomic_commit(&self, flags: AtomicCommitFlags, commit: &AtomicCommit) -> io::Result<()>;

    /// Drain all pending kernel events
    fn receive_events(&self) -> io::Result<Vec<PageFlip>>;
}
