//! Crtcs and the framebuffer slots they scan out of

use drm::control::{crtc, plane, Mode};

use super::{
    commit::AtomicCommit,
    device::KmsDevice,
    error::{access, Error},
    framebuffer::{BufferSlots, FramebufferId, Framebuffers},
    object::{DrmObject, ObjectId},
};

const REQUIRED_PROPERTIES: &[&str] = &["MODE_ID", "ACTIVE"];

/// A display controller scanning out to one or more connectors
#[derive(Debug)]
pub struct Crtc {
    handle: crtc::Handle,
    object: DrmObject,
    pipe_index: usize,
    primary_plane: plane::Handle,
    cursor_plane: Option<plane::Handle>,
    buffers: BufferSlots,
}

impl Crtc {
    pub(crate) fn new<D: KmsDevice + ?Sized>(
        device: &D,
        handle: crtc::Handle,
        pipe_index: usize,
        primary_plane: plane::Handle,
        cursor_plane: Option<plane::Handle>,
    ) -> Result<Crtc, Error> {
        let mut object = DrmObject::new(ObjectId::Crtc(handle));
        object.update_properties(device, REQUIRED_PROPERTIES)?;
        Ok(Crtc {
            handle,
            object,
            pipe_index,
            primary_plane,
            cursor_plane,
            buffers: BufferSlots::default(),
        })
    }

    /// Kernel handle of the crtc
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Stable ordinal of this crtc on its device
    pub fn pipe_index(&self) -> usize {
        self.pipe_index
    }

    /// The primary plane assigned to this crtc
    pub fn primary_plane(&self) -> plane::Handle {
        self.primary_plane
    }

    /// The cursor plane assigned to this crtc, if any
    pub fn cursor_plane(&self) -> Option<plane::Handle> {
        self.cursor_plane
    }

    /// Property cache of the crtc
    pub fn object(&self) -> &DrmObject {
        &self.object
    }

    pub(crate) fn object_mut(&mut self) -> &mut DrmObject {
        &mut self.object
    }

    /// Refresh the property cache, dropping anything staged
    pub fn update_properties<D: KmsDevice + ?Sized>(&mut self, device: &D) -> Result<(), Error> {
        self.object.update_properties(device, REQUIRED_PROPERTIES)
    }

    /// Read the mode the kernel currently scans out, bypassing the property cache
    ///
    /// Used to reconcile after the mode was changed by someone else.
    pub fn query_current_mode<D: KmsDevice + ?Sized>(&self, device: &D) -> Result<Option<Mode>, Error> {
        device
            .current_mode(self.handle)
            .map_err(access("Error loading crtc info", device.dev_path()))
    }

    /// Whether the crtc is active according to the last committed state
    pub fn is_active(&self) -> bool {
        self.object.value("ACTIVE") == Some(1)
    }

    /// Number of entries of the gamma lookup table, zero if unsupported
    pub fn gamma_ramp_size(&self) -> usize {
        if self.object.has_property("GAMMA_LUT") {
            self.object.value("GAMMA_LUT_SIZE").unwrap_or(0) as usize
        } else {
            0
        }
    }

    /// Whether the crtc supports a color transformation matrix
    pub fn supports_ctm(&self) -> bool {
        self.object.has_property("CTM")
    }

    /// Whether the crtc supports variable refresh rate
    pub fn supports_vrr(&self) -> bool {
        self.object.has_property("VRR_ENABLED")
    }

    /// Stage the writes powering down this crtc
    pub fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), Error> {
        self.object.stage(commit, "ACTIVE", 0)?;
        self.object.stage(commit, "MODE_ID", 0)?;
        self.object.stage_optional(commit, "VRR_ENABLED", 0);
        commit.set_modeset();
        Ok(())
    }

    /// Stage a mode blob and the active flag
    pub fn set_mode(&mut self, commit: &mut AtomicCommit, mode_blob: u64, active: bool) -> Result<(), Error> {
        self.object.stage(commit, "MODE_ID", mode_blob)?;
        self.object.stage(commit, "ACTIVE", active as u64)?;
        commit.set_modeset();
        Ok(())
    }

    /// Stage the variable refresh rate state
    pub fn set_vrr(&mut self, commit: &mut AtomicCommit, enabled: bool) -> Result<(), Error> {
        if !self.object.stage_optional(commit, "VRR_ENABLED", enabled as u64) && enabled {
            return Err(Error::UnknownProperty {
                handle: self.object.id().raw(),
                name: "VRR_ENABLED",
            });
        }
        Ok(())
    }

    /// Stage a gamma lookup table blob, `0` resets to linear
    pub fn set_gamma(&mut self, commit: &mut AtomicCommit, blob: u64) -> Result<(), Error> {
        if !self.object.stage_optional(commit, "GAMMA_LUT", blob) && blob != 0 {
            return Err(Error::UnknownProperty {
                handle: self.object.id().raw(),
                name: "GAMMA_LUT",
            });
        }
        Ok(())
    }

    /// Stage a color transformation matrix blob, `0` resets to identity
    pub fn set_ctm(&mut self, commit: &mut AtomicCommit, blob: u64) -> Result<(), Error> {
        if !self.object.stage_optional(commit, "CTM", blob) && blob != 0 {
            return Err(Error::UnknownProperty {
                handle: self.object.id().raw(),
                name: "CTM",
            });
        }
        Ok(())
    }

    /// Framebuffer slots of the crtc
    pub fn buffers(&self) -> &BufferSlots {
        &self.buffers
    }

    /// See [`BufferSlots::set_next`]
    pub fn set_next(&mut self, arena: &mut Framebuffers, fb: FramebufferId) -> Result<(), Error> {
        self.buffers.set_next(arena, fb)
    }

    /// See [`BufferSlots::set_current`]
    pub fn set_current(&mut self, arena: &mut Framebuffers, fb: Option<FramebufferId>) -> Result<(), Error> {
        self.buffers.set_current(arena, fb)
    }

    /// See [`BufferSlots::flip_buffer`]
    pub fn flip_buffer(&mut self, arena: &mut Framebuffers) {
        self.buffers.flip_buffer(arena)
    }

    /// See [`BufferSlots::release_buffers`]
    pub fn release_buffers(&mut self, arena: &mut Framebuffers) {
        self.buffers.release_buffers(arena)
    }
}

#[cfg(test)]
mod test {
    use super::Crtc;
    use crate::backend::drm::{
        commit::AtomicCommit,
        device::test::{test_mode, TestDevice},
        object::ObjectId,
    };

    #[test]
    fn disable_only_stages() {
        let (device, out) = TestDevice::single_output("HDMI-A-1", vec![test_mode(1920, 1080, 60)]);
        device.set_property(out.crtc, "ACTIVE", 1);
        let mut crtc = Crtc::new(&device, out.crtc, 0, out.primary, Some(out.cursor)).unwrap();
        assert!(crtc.is_active());
        assert_eq!(crtc.gamma_ramp_size(), 256);

        let mut commit = AtomicCommit::new();
        crtc.disable(&mut commit).unwrap();
        assert!(commit.requires_modeset());
        assert_eq!(commit.value(ObjectId::Crtc(out.crtc), "ACTIVE"), Some(0));
        assert!(crtc.object().is_dirty());
        assert!(crtc.is_active());
        assert!(device.commits().is_empty());
    }

    #[test]
    fn optional_properties() {
        let (device, out) = TestDevice::single_output("HDMI-A-1", vec![test_mode(1920, 1080, 60)]);
        device.remove_property(out.crtc, "VRR_ENABLED");
        device.remove_property(out.crtc, "GAMMA_LUT");
        let mut crtc = Crtc::new(&device, out.crtc, 0, out.primary, None).unwrap();
        assert_eq!(crtc.gamma_ramp_size(), 0);
        assert!(!crtc.supports_vrr());

        let mut commit = AtomicCommit::new();
        crtc.set_vrr(&mut commit, false).unwrap();
        crtc.set_gamma(&mut commit, 0).unwrap();
        assert!(commit.is_empty());
        assert!(crtc.set_vrr(&mut commit, true).is_err());
    }

    #[test]
    fn query_current_mode_bypasses_cache() {
        let (device, out) = TestDevice::single_output("HDMI-A-1", vec![test_mode(1920, 1080, 60)]);
        let crtc = Crtc::new(&device, out.crtc, 0, out.primary, None).unwrap();
        assert_eq!(crtc.query_current_mode(&device).unwrap(), None);

        // another process sets a mode behind our back
        let blob = crate::backend::drm::device::KmsDevice::create_mode_blob(&device, &test_mode(1280, 720, 60))
            .unwrap();
        device.set_property(out.crtc, "MODE_ID", blob);
        let mode = crtc.query_current_mode(&device).unwrap().unwrap();
        assert_eq!(mode.size(), (1280, 720));
        assert_eq!(crtc.object().value("MODE_ID"), Some(0));
    }
}
