//! Property cache shared by all kernel display objects
//!
//! Crtcs, connectors and planes only differ in the properties they expose, so
//! instead of a type hierarchy every object composes a [`DrmObject`], which
//! caches the last committed property values and tracks speculative writes
//! of an in-flight [`AtomicCommit`] separately.

use std::collections::HashMap;

use drm::control::{connector, crtc, plane, property, RawResourceHandle};
use tracing::trace;

use super::{
    commit::AtomicCommit,
    device::KmsDevice,
    error::{AccessError, Error},
};

/// Identity of a kernel display object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A crtc
    Crtc(crtc::Handle),
    /// A connector
    Connector(connector::Handle),
    /// A plane
    Plane(plane::Handle),
}

impl ObjectId {
    /// Raw kernel id of the object
    pub fn raw(&self) -> RawResourceHandle {
        match *self {
            ObjectId::Crtc(h) => h.into(),
            ObjectId::Connector(h) => h.into(),
            ObjectId::Plane(h) => h.into(),
        }
    }
}

impl From<crtc::Handle> for ObjectId {
    fn from(h: crtc::Handle) -> Self {
        ObjectId::Crtc(h)
    }
}

impl From<connector::Handle> for ObjectId {
    fn from(h: connector::Handle) -> Self {
        ObjectId::Connector(h)
    }
}

impl From<plane::Handle> for ObjectId {
    fn from(h: plane::Handle) -> Self {
        ObjectId::Plane(h)
    }
}

/// Raw property value referencing another kernel object
pub(crate) fn raw_id(handle: impl Into<RawResourceHandle>) -> u64 {
    handle.into().get() as u64
}

#[derive(Debug, Clone, Copy)]
struct CachedProperty {
    handle: property::Handle,
    value: u64,
}

/// Cached property state of a kernel object
#[derive(Debug)]
pub struct DrmObject {
    id: ObjectId,
    properties: HashMap<String, CachedProperty>,
    pending: HashMap<&'static str, u64>,
    dirty: bool,
}

impl DrmObject {
    pub(crate) fn new(id: ObjectId) -> DrmObject {
        DrmObject {
            id,
            properties: HashMap::new(),
            pending: HashMap::new(),
            dirty: false,
        }
    }

    /// Identity of this object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Refresh the cached properties from the kernel
    ///
    /// Fails with [`Error::ObjectGone`] if the object does not exist anymore and
    /// with [`Error::UnknownProperty`] if one of `required` is not exposed.
    /// Any speculative values are discarded.
    pub fn update_properties<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        required: &[&'static str],
    ) -> Result<(), Error> {
        let props = device.properties(self.id).map_err(|source| {
            if matches!(source.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENOENT)) {
                Error::ObjectGone
            } else {
                Error::Access(AccessError {
                    errmsg: "Failed to read object properties",
                    dev: device.dev_path(),
                    source,
                })
            }
        })?;

        let properties: HashMap<String, CachedProperty> = props
            .into_iter()
            .map(|p| {
                (
                    p.name,
                    CachedProperty {
                        handle: p.handle,
                        value: p.value,
                    },
                )
            })
            .collect();

        if let Some(name) = required.iter().find(|name| !properties.contains_key(**name)) {
            return Err(Error::UnknownProperty {
                handle: self.id.raw(),
                name,
            });
        }

        self.properties = properties;
        self.pending.clear();
        self.dirty = false;
        Ok(())
    }

    /// Returns true if the object exposes the named property
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Kernel handle of the named property
    pub fn property_handle(&self, name: &'static str) -> Result<property::Handle, Error> {
        self.properties
            .get(name)
            .map(|p| p.handle)
            .ok_or(Error::UnknownProperty {
                handle: self.id.raw(),
                name,
            })
    }

    /// Last committed value of the named property
    pub fn value(&self, name: &str) -> Option<u64> {
        self.properties.get(name).map(|p| p.value)
    }

    /// Value the property will have if the in-flight commit succeeds
    pub fn pending_value(&self, name: &str) -> Option<u64> {
        self.pending.get(name).copied().or_else(|| self.value(name))
    }

    /// Returns true while speculative values are staged
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Add a property write to `commit` and record it as speculative
    pub fn stage(&mut self, commit: &mut AtomicCommit, name: &'static str, value: u64) -> Result<(), Error> {
        let handle = self.property_handle(name)?;
        commit.add_property(self.id, handle, name, value);
        self.pending.insert(name, value);
        self.dirty = true;
        Ok(())
    }

    /// Like [`DrmObject::stage`], but skips properties the object lacks
    ///
    /// Returns whether the write was staged.
    pub fn stage_optional(&mut self, commit: &mut AtomicCommit, name: &'static str, value: u64) -> bool {
        if !self.has_property(name) {
            return false;
        }
        self.stage(commit, name, value).is_ok()
    }

    /// The commit carrying the staged values was accepted
    pub(crate) fn commit_succeeded(&mut self) {
        for (name, value) in self.pending.drain() {
            if let Some(prop) = self.properties.get_mut(name) {
                prop.value = value;
            }
        }
        self.dirty = false;
    }

    /// The commit carrying the staged values was rejected or was a test
    pub(crate) fn commit_failed(&mut self) {
        if self.dirty {
            trace!(object = ?self.id, "discarding {} staged properties", self.pending.len());
        }
        self.pending.clear();
        self.dirty = false;
    }
}
