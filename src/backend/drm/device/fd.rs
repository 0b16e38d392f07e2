use std::{
    collections::HashMap,
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use drm::{
    buffer::Buffer,
    control::{
        connector, crtc, dumbbuffer::DumbBuffer, framebuffer, plane, property, AtomicCommitFlags,
        Device as ControlDevice, Event, Mode, PlaneType, ResourceHandle,
    },
    ClientCapability, Device as BasicDevice, DriverCapability,
};
use drm_fourcc::DrmFourcc;
use tracing::{error, info, trace, warn};

use super::{ConnectorInfo, DeviceResources, KmsDevice, PageFlip, PlaneInfo, PropertyValue};
use crate::{
    backend::drm::{commit::AtomicCommit, object::ObjectId},
    utils::{DevPath, Physical, Size},
};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
    property_names: Mutex<HashMap<property::Handle, String>>,
    dumb_buffers: Mutex<HashMap<framebuffer::Handle, DumbBuffer>>,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.dev_path());
        let buffers = std::mem::take(
            self.dumb_buffers
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (fb, buffer) in buffers {
            let _ = self.destroy_framebuffer(fb);
            let _ = self.destroy_dumb_buffer(buffer);
        }
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ref-counted file descriptor of an open drm device
///
/// Cloning yields another handle to the same device.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again. The atomic api is enabled, devices without
    /// atomic support are rejected.
    ///
    /// Never create multiple `DrmDeviceFd` out of the same file descriptor, clone
    /// the `DrmDeviceFd` instead.
    pub fn new(fd: OwnedFd) -> io::Result<DrmDeviceFd> {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
            property_names: Mutex::new(HashMap::new()),
            dumb_buffers: Mutex::new(HashMap::new()),
        };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // This is only needed on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        dev.set_client_capability(ClientCapability::UniversalPlanes, true)?;
        dev.set_client_capability(ClientCapability::Atomic, true)?;

        Ok(DrmDeviceFd(Arc::new(dev)))
    }

    /// Returns true if this process holds the drm master lock
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Returns the `dev_t` of the underlying device
    pub fn dev_id(&self) -> io::Result<libc::dev_t> {
        Ok(rustix::fs::fstat(&self.0.fd)?.st_rdev as libc::dev_t)
    }

    fn property_name(&self, handle: property::Handle) -> io::Result<String> {
        if let Some(name) = lock(&self.0.property_names).get(&handle) {
            return Ok(name.clone());
        }
        let info = self.0.get_property(handle)?;
        let name = info
            .name()
            .to_str()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
            .to_string();
        lock(&self.0.property_names).insert(handle, name.clone());
        Ok(name)
    }

    fn read_properties<T: ResourceHandle>(&self, handle: T) -> io::Result<Vec<PropertyValue>> {
        let set = self.0.get_properties(handle)?;
        let (handles, values) = set.as_props_and_values();
        handles
            .iter()
            .zip(values)
            .map(|(handle, value)| {
                Ok(PropertyValue {
                    handle: *handle,
                    name: self.property_name(*handle)?,
                    value: *value,
                })
            })
            .collect()
    }

    fn property_value<T: ResourceHandle>(&self, handle: T, name: &str) -> io::Result<Option<u64>> {
        Ok(self
            .read_properties(handle)?
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.value))
    }
}

fn depth_and_bpp(format: DrmFourcc) -> io::Result<(u32, u32)> {
    match format {
        DrmFourcc::Xrgb8888 => Ok((24, 32)),
        DrmFourcc::Argb8888 => Ok((32, 32)),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "only 32 bit rgb dumb buffers are supported",
        )),
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        DevPath::dev_path(&*self.0)
    }

    fn resource_handles(&self) -> io::Result<DeviceResources> {
        let resources = self.0.resource_handles()?;
        Ok(DeviceResources {
            crtcs: resources.crtcs().to_vec(),
            connectors: resources.connectors().to_vec(),
            planes: self.0.plane_handles()?,
        })
    }

    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertyValue>> {
        match object {
            ObjectId::Crtc(handle) => self.read_properties(handle),
            ObjectId::Plane(handle) => self.read_properties(handle),
            ObjectId::Connector(handle) => self.read_properties(handle),
        }
    }

    fn connector_info(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        let info = self.0.get_connector(handle, true)?;
        let resources = self.0.resource_handles()?;

        let mut possible_crtcs = Vec::new();
        for encoder in info.encoders() {
            let Ok(encoder) = self.0.get_encoder(*encoder) else {
                continue;
            };
            for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
                if !possible_crtcs.contains(&crtc) {
                    possible_crtcs.push(crtc);
                }
            }
        }
        let current_crtc = info
            .current_encoder()
            .and_then(|encoder| self.0.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc());
        let non_desktop = self.property_value(handle, "non-desktop")?.unwrap_or(0) != 0;

        Ok(ConnectorInfo {
            handle,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            state: info.state(),
            modes: info.modes().to_vec(),
            possible_crtcs,
            physical_size: info.size(),
            non_desktop,
            current_crtc,
        })
    }

    fn plane_info(&self, handle: plane::Handle) -> io::Result<PlaneInfo> {
        let info = self.0.get_plane(handle)?;
        let resources = self.0.resource_handles()?;
        let kind = match self.property_value(handle, "type")? {
            Some(x) if x == PlaneType::Primary as u64 => PlaneType::Primary,
            Some(x) if x == PlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };
        Ok(PlaneInfo {
            handle,
            kind,
            possible_crtcs: resources.filter_crtcs(info.possible_crtcs()),
            formats: info
                .formats()
                .iter()
                .filter_map(|code| DrmFourcc::try_from(*code).ok())
                .collect(),
        })
    }

    fn current_mode(&self, crtc: crtc::Handle) -> io::Result<Option<Mode>> {
        Ok(self.0.get_crtc(crtc)?.mode())
    }

    fn cursor_size(&self) -> Size<u32, Physical> {
        let width = self.0.get_driver_capability(DriverCapability::CursorWidth).unwrap_or(64);
        let height = self.0.get_driver_capability(DriverCapability::CursorHeight).unwrap_or(64);
        (width as u32, height as u32).into()
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        match self.0.create_property_blob(mode)? {
            property::Value::Blob(id) => Ok(id),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "kernel returned no blob")),
        }
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u64> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.as_fd(), &mut data)?;
        Ok(blob.blob_id as u64)
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.0.destroy_property_blob(blob)
    }

    fn create_dumb_framebuffer(
        &self,
        size: Size<u32, Physical>,
        format: DrmFourcc,
    ) -> io::Result<framebuffer::Handle> {
        let (depth, bpp) = depth_and_bpp(format)?;
        let buffer = self.0.create_dumb_buffer((size.w, size.h), format, bpp)?;
        let fb = match self.0.add_framebuffer(&buffer, depth, bpp) {
            Ok(fb) => fb,
            Err(err) => {
                let _ = self.0.destroy_dumb_buffer(buffer);
                return Err(err);
            }
        };
        trace!(?fb, ?size, ?format, "created dumb framebuffer");
        lock(&self.0.dumb_buffers).insert(fb, buffer);
        Ok(fb)
    }

    fn write_framebuffer(&self, framebuffer: framebuffer::Handle, data: &[u8]) -> io::Result<()> {
        let mut buffers = lock(&self.0.dumb_buffers);
        let buffer = buffers
            .get_mut(&framebuffer)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let (width, height) = buffer.size();
        let pitch = buffer.pitch() as usize;
        let row = width as usize * 4;
        if data.len() > row * height as usize {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut mapping = self.0.map_dumb_buffer(buffer)?;
        let target: &mut [u8] = mapping.as_mut();
        for (y, src) in data.chunks(row).enumerate() {
            target[y * pitch..y * pitch + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()> {
        self.0.destroy_framebuffer(framebuffer)?;
        if let Some(buffer) = lock(&self.0.dumb_buffers).remove(&framebuffer) {
            self.0.destroy_dumb_buffer(buffer)?;
        }
        Ok(())
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, commit: &AtomicCommit) -> io::Result<()> {
        self.0.atomic_commit(flags, commit.to_request())
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlip>> {
        let mut flips = Vec::new();
        for event in self.0.receive_events()? {
            if let Event::PageFlip(event) = event {
                flips.push(PageFlip {
                    crtc: event.crtc,
                    sequence: event.frame,
                    time: event.duration,
                });
            } else {
                trace!(
                    "Got a non-page-flip event of device '{:?}'.",
                    KmsDevice::dev_path(self)
                );
            }
        }
        Ok(flips)
    }
}
