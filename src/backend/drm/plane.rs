//! Planes and the writes positioning a framebuffer on them

use drm::control::{crtc, framebuffer, plane};
use drm_fourcc::DrmFourcc;

use super::{
    commit::AtomicCommit,
    device::{KmsDevice, PlaneInfo},
    error::{access, Error},
    framebuffer::{BufferSlots, Framebuffers},
    object::{raw_id, DrmObject, ObjectId},
    PlaneType,
};
use crate::utils::{Physical, Point, Rectangle, Transform};

const REQUIRED_PROPERTIES: &[&str] = &[
    "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H",
];

/// Convert a whole pixel value into the 16.16 fixed point format of `SRC_*` properties
pub fn to_fixed(value: u32) -> u64 {
    (value as u64) << 16
}

bitflags::bitflags! {
    /// Bits of the drm `rotation` plane property
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DrmRotation: u8 {
        /// No rotation
        const ROTATE_0      =   0b00000001;
        /// Rotate by 90 degrees
        const ROTATE_90     =   0b00000010;
        /// Rotate by 180 degrees
        const ROTATE_180    =   0b00000100;
        /// Rotate by 270 degrees
        const ROTATE_270    =   0b00001000;
        /// Mirror horizontally
        const REFLECT_X     =   0b00010000;
        /// Mirror vertically
        const REFLECT_Y     =   0b00100000;
    }
}

impl From<Transform> for DrmRotation {
    fn from(transform: Transform) -> Self {
        match transform {
            Transform::Normal => DrmRotation::ROTATE_0,
            Transform::_90 => DrmRotation::ROTATE_90,
            Transform::_180 => DrmRotation::ROTATE_180,
            Transform::_270 => DrmRotation::ROTATE_270,
            Transform::Flipped => DrmRotation::REFLECT_Y,
            Transform::Flipped90 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_90,
            Transform::Flipped180 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_180,
            Transform::Flipped270 => DrmRotation::REFLECT_Y | DrmRotation::ROTATE_270,
        }
    }
}

/// Configuration of a plane for one commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneConfig {
    /// Framebuffer to scan out
    pub fb: framebuffer::Handle,
    /// Region of the framebuffer to sample from
    pub src: Rectangle<u32, Physical>,
    /// Region of the crtc to scan out to
    pub dst: Rectangle<i32, Physical>,
    /// Transform to apply
    pub transform: Transform,
}

/// A hardware plane
#[derive(Debug)]
pub struct Plane {
    handle: plane::Handle,
    object: DrmObject,
    kind: PlaneType,
    possible_crtcs: Vec<crtc::Handle>,
    formats: Vec<DrmFourcc>,
    buffers: BufferSlots,
}

impl Plane {
    pub(crate) fn new<D: KmsDevice + ?Sized>(device: &D, handle: plane::Handle) -> Result<Plane, Error> {
        let PlaneInfo {
            kind,
            possible_crtcs,
            formats,
            ..
        } = device
            .plane_info(handle)
            .map_err(access("Error loading plane info", device.dev_path()))?;
        let mut object = DrmObject::new(ObjectId::Plane(handle));
        object.update_properties(device, REQUIRED_PROPERTIES)?;
        Ok(Plane {
            handle,
            object,
            kind,
            possible_crtcs,
            formats,
            buffers: BufferSlots::default(),
        })
    }

    /// Kernel handle of the plane
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// Type of the plane
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// Property cache of the plane
    pub fn object(&self) -> &DrmObject {
        &self.object
    }

    pub(crate) fn object_mut(&mut self) -> &mut DrmObject {
        &mut self.object
    }

    /// Returns true if the plane can be attached to the crtc
    pub fn is_compatible(&self, crtc: crtc::Handle) -> bool {
        self.possible_crtcs.contains(&crtc)
    }

    /// Returns true if the plane can scan out the format
    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&format)
    }

    /// Stage the writes detaching this plane
    pub fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), Error> {
        self.object.stage(commit, "FB_ID", 0)?;
        self.object.stage(commit, "CRTC_ID", 0)?;
        Ok(())
    }

    /// Stage a full plane configuration
    pub fn set(&mut self, commit: &mut AtomicCommit, crtc: crtc::Handle, config: &PlaneConfig) -> Result<(), Error> {
        let object = &mut self.object;
        object.stage(commit, "FB_ID", raw_id(config.fb))?;
        object.stage(commit, "CRTC_ID", raw_id(crtc))?;
        object.stage(commit, "SRC_X", to_fixed(config.src.loc.x))?;
        object.stage(commit, "SRC_Y", to_fixed(config.src.loc.y))?;
        object.stage(commit, "SRC_W", to_fixed(config.src.size.w))?;
        object.stage(commit, "SRC_H", to_fixed(config.src.size.h))?;
        object.stage(commit, "CRTC_X", config.dst.loc.x as i64 as u64)?;
        object.stage(commit, "CRTC_Y", config.dst.loc.y as i64 as u64)?;
        object.stage(commit, "CRTC_W", config.dst.size.w as u64)?;
        object.stage(commit, "CRTC_H", config.dst.size.h as u64)?;
        if !object.stage_optional(commit, "rotation", DrmRotation::from(config.transform).bits() as u64)
            && config.transform != Transform::Normal
        {
            return Err(Error::UnknownProperty {
                handle: object.id().raw(),
                name: "rotation",
            });
        }
        Ok(())
    }

    /// Stage only a new position, keeping framebuffer and size
    pub fn set_position(&mut self, commit: &mut AtomicCommit, position: Point<i32, Physical>) -> Result<(), Error> {
        self.object.stage(commit, "CRTC_X", position.x as i64 as u64)?;
        self.object.stage(commit, "CRTC_Y", position.y as i64 as u64)?;
        Ok(())
    }

    /// Framebuffer slots of the plane
    pub fn buffers(&self) -> &BufferSlots {
        &self.buffers
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut BufferSlots {
        &mut self.buffers
    }

    /// See [`BufferSlots::release_buffers`]
    pub fn release_buffers(&mut self, arena: &mut Framebuffers) {
        self.buffers.release_buffers(arena)
    }
}

#[cfg(test)]
mod test {
    use super::{to_fixed, DrmRotation, Plane, PlaneConfig};
    use crate::{
        backend::drm::{
            commit::AtomicCommit,
            device::{
                test::{test_mode, TestDevice},
                KmsDevice,
            },
            object::{raw_id, ObjectId},
            PlaneType,
        },
        utils::{Rectangle, Transform},
    };
    use drm_fourcc::DrmFourcc;

    #[test]
    fn fixed_point() {
        assert_eq!(to_fixed(1), 0x10000);
        assert_eq!(to_fixed(1920), 1920 << 16);
        assert_eq!(DrmRotation::from(Transform::Normal).bits(), 1);
        assert_eq!(DrmRotation::from(Transform::Flipped90).bits(), 0b0010_0010);
    }

    #[test]
    fn set_stages_geometry() {
        let (device, out) = TestDevice::single_output("eDP-1", vec![test_mode(1920, 1080, 60)]);
        let mut plane = Plane::new(&device, out.cursor).unwrap();
        assert_eq!(plane.kind(), PlaneType::Cursor);
        assert!(plane.is_compatible(out.crtc));
        assert!(plane.supports_format(DrmFourcc::Argb8888));

        let fb = device
            .create_dumb_framebuffer((64, 64).into(), DrmFourcc::Argb8888)
            .unwrap();
        let mut commit = AtomicCommit::new();
        plane
            .set(
                &mut commit,
                out.crtc,
                &PlaneConfig {
                    fb,
                    src: Rectangle::from_size((64, 64).into()),
                    dst: Rectangle::new((-10, 20).into(), (64, 64).into()),
                    transform: Transform::Normal,
                },
            )
            .unwrap();
        let id = ObjectId::Plane(out.cursor);
        assert_eq!(commit.value(id, "FB_ID"), Some(raw_id(fb)));
        assert_eq!(commit.value(id, "SRC_W"), Some(64 << 16));
        assert_eq!(commit.value(id, "CRTC_X"), Some(-10i64 as u64));

        let mut moved = AtomicCommit::new();
        plane.set_position(&mut moved, (5, 5).into()).unwrap();
        assert_eq!(moved.len(), 2);
    }

    #[test]
    fn transform_needs_rotation_property() {
        let (device, out) = TestDevice::single_output("eDP-1", vec![test_mode(1920, 1080, 60)]);
        device.remove_property(out.primary, "rotation");
        let mut plane = Plane::new(&device, out.primary).unwrap();
        let fb = device
            .create_dumb_framebuffer((1920, 1080).into(), DrmFourcc::Xrgb8888)
            .unwrap();
        let mut config = PlaneConfig {
            fb,
            src: Rectangle::from_size((1920, 1080).into()),
            dst: Rectangle::from_size((1920, 1080).into()),
            transform: Transform::Normal,
        };
        assert!(plane.set(&mut AtomicCommit::new(), out.crtc, &config).is_ok());
        config.transform = Transform::_90;
        assert!(plane.set(&mut AtomicCommit::new(), out.crtc, &config).is_err());
    }
}
