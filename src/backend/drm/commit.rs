//! Builder for atomic commits
//!
//! An [`AtomicCommit`] collects property writes for any number of kernel objects,
//! which are later submitted to the kernel as a single all-or-nothing request.

use drm::control::{atomic::AtomicModeReq, property, AtomicCommitFlags, RawResourceHandle};
use smallvec::SmallVec;

use super::object::ObjectId;

/// A single property write of an [`AtomicCommit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    /// Object the property belongs to
    pub object: ObjectId,
    /// Kernel handle of the property
    pub property: property::Handle,
    /// Name of the property
    pub name: &'static str,
    /// Raw value to write
    pub value: u64,
}

/// How a commit is submitted to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Only check if the kernel would accept the commit
    Test,
    /// Submit the commit and request a page-flip event
    Commit,
    /// Submit the commit without requesting an event
    ///
    /// Used for commits leaving the crtc inactive, which never produce a flip.
    CommitWithoutEvent,
}

/// A set of property changes to be applied atomically
#[derive(Debug, Default, Clone)]
pub struct AtomicCommit {
    // a full modeset of one pipeline stays below this
    writes: SmallVec<[PropertyWrite; 32]>,
    modeset: bool,
}

impl AtomicCommit {
    /// Create a new empty commit
    pub fn new() -> AtomicCommit {
        AtomicCommit::default()
    }

    /// Add a property write to this commit
    ///
    /// Writing the same property of the same object again replaces the previous value.
    pub fn add_property(&mut self, object: ObjectId, property: property::Handle, name: &'static str, value: u64) {
        if let Some(write) = self
            .writes
            .iter_mut()
            .find(|w| w.object == object && w.property == property)
        {
            write.value = value;
        } else {
            self.writes.push(PropertyWrite {
                object,
                property,
                name,
                value,
            });
        }
    }

    /// Mark this commit as requiring a modeset
    pub fn set_modeset(&mut self) {
        self.modeset = true;
    }

    /// Returns true if this commit requires a modeset
    pub fn requires_modeset(&self) -> bool {
        self.modeset
    }

    /// Returns true if the commit contains no writes
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of property writes in this commit
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// All property writes of this commit, in insertion order
    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    /// Value written to the named property of an object, if any
    pub fn value(&self, object: ObjectId, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .find(|w| w.object == object && w.name == name)
            .map(|w| w.value)
    }

    /// Objects touched by this commit, each reported once
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.writes
            .iter()
            .enumerate()
            .filter(move |(i, w)| !self.writes[..*i].iter().any(|o| o.object == w.object))
            .map(|(_, w)| w.object)
    }

    /// Returns true if any write of this commit targets the given object
    pub fn touches(&self, object: ObjectId) -> bool {
        self.writes.iter().any(|w| w.object == object)
    }

    /// Kernel flags to submit this commit with
    pub fn flags(&self, mode: CommitMode) -> AtomicCommitFlags {
        let mut flags = match mode {
            CommitMode::Test => AtomicCommitFlags::TEST_ONLY,
            CommitMode::Commit if self.modeset => AtomicCommitFlags::PAGE_FLIP_EVENT,
            CommitMode::Commit => AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
            CommitMode::CommitWithoutEvent => AtomicCommitFlags::empty(),
        };
        if self.modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        flags
    }

    /// Convert into a kernel request
    pub fn to_request(&self) -> AtomicModeReq {
        let mut req = AtomicModeReq::new();
        for write in &self.writes {
            let object: RawResourceHandle = write.object.raw();
            req.add_raw_property(object, write.property, write.value);
        }
        req
    }
}

#[cfg(test)]
mod test {
    use super::{AtomicCommit, CommitMode};
    use crate::backend::drm::object::ObjectId;
    use drm::control::{crtc, from_u32, plane, property, AtomicCommitFlags};

    fn handles() -> (crtc::Handle, plane::Handle, property::Handle, property::Handle) {
        (
            from_u32(31).unwrap(),
            from_u32(40).unwrap(),
            from_u32(5).unwrap(),
            from_u32(6).unwrap(),
        )
    }

    #[test]
    fn duplicate_writes_keep_last_value() {
        let (crtc, _, active, _) = handles();
        let mut commit = AtomicCommit::new();
        commit.add_property(ObjectId::Crtc(crtc), active, "ACTIVE", 1);
        commit.add_property(ObjectId::Crtc(crtc), active, "ACTIVE", 0);
        assert_eq!(commit.len(), 1);
        assert_eq!(commit.value(ObjectId::Crtc(crtc), "ACTIVE"), Some(0));
    }

    #[test]
    fn objects_are_reported_once() {
        let (crtc, plane, a, b) = handles();
        let mut commit = AtomicCommit::new();
        commit.add_property(ObjectId::Crtc(crtc), a, "ACTIVE", 1);
        commit.add_property(ObjectId::Plane(plane), a, "FB_ID", 7);
        commit.add_property(ObjectId::Crtc(crtc), b, "MODE_ID", 9);
        let objects: Vec<_> = commit.objects().collect();
        assert_eq!(objects, vec![ObjectId::Crtc(crtc), ObjectId::Plane(plane)]);
    }

    #[test]
    fn flags_follow_modeset() {
        let mut commit = AtomicCommit::new();
        assert_eq!(
            commit.flags(CommitMode::Commit),
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK
        );
        assert_eq!(commit.flags(CommitMode::Test), AtomicCommitFlags::TEST_ONLY);
        commit.set_modeset();
        assert_eq!(
            commit.flags(CommitMode::Test),
            AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET
        );
        assert_eq!(
            commit.flags(CommitMode::Commit),
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::ALLOW_MODESET
        );
        assert_eq!(
            commit.flags(CommitMode::CommitWithoutEvent),
            AtomicCommitFlags::ALLOW_MODESET
        );
    }
}
