//! Framebuffer ownership
//!
//! Framebuffers live in an arena and are referred to by a [`FramebufferId`], a small
//! index tagged with a generation. Each entry counts two kinds of references:
//! the producer (the swapchain that renders into it) and scanout slots
//! (`current`/`next` of crtcs and planes). Writing is only allowed while no scanout
//! slot references the buffer, and the kernel object is destroyed once both counts
//! drop to zero.

use drm::control::framebuffer;
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::trace;

use super::error::Error;
use crate::utils::{Physical, Size};

/// Handle of a framebuffer in a [`Framebuffers`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId {
    index: u32,
    generation: u32,
}

/// Metadata of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    /// Kernel handle
    pub handle: framebuffer::Handle,
    /// Size in pixels
    pub size: Size<u32, Physical>,
    /// Pixel format
    pub format: DrmFourcc,
    /// Format modifier
    pub modifier: DrmModifier,
}

#[derive(Debug)]
struct Entry {
    framebuffer: Framebuffer,
    producer_refs: u32,
    scanout_refs: u32,
}

#[derive(Debug)]
enum Slot {
    Occupied { generation: u32, entry: Entry },
    Vacant { generation: u32 },
}

/// Arena of framebuffers
#[derive(Debug, Default)]
pub struct Framebuffers {
    slots: Vec<Slot>,
    free: Vec<u32>,
    released: Vec<framebuffer::Handle>,
}

impl Framebuffers {
    /// Track a new framebuffer, owned by its producer
    pub fn insert(&mut self, framebuffer: Framebuffer) -> FramebufferId {
        let entry = Entry {
            framebuffer,
            producer_refs: 1,
            scanout_refs: 0,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { generation, .. } => *generation + 1,
            };
            *slot = Slot::Occupied { generation, entry };
            FramebufferId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { generation: 0, entry });
            FramebufferId { index, generation: 0 }
        }
    }

    fn entry(&self, id: FramebufferId) -> Option<&Entry> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { generation, entry }) if *generation == id.generation => Some(entry),
            _ => None,
        }
    }

    fn entry_mut(&mut self, id: FramebufferId) -> Result<&mut Entry, Error> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { generation, entry }) if *generation == id.generation => Ok(entry),
            _ => Err(Error::UnknownFramebuffer),
        }
    }

    /// Metadata of a live framebuffer
    pub fn get(&self, id: FramebufferId) -> Option<&Framebuffer> {
        self.entry(id).map(|e| &e.framebuffer)
    }

    /// Returns true if the id refers to a live framebuffer
    pub fn contains(&self, id: FramebufferId) -> bool {
        self.entry(id).is_some()
    }

    /// Number of live framebuffers
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    /// Returns true if no framebuffer is alive
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while a crtc or plane slot references the framebuffer
    pub fn is_scanned_out(&self, id: FramebufferId) -> bool {
        self.entry(id).map(|e| e.scanout_refs > 0).unwrap_or(false)
    }

    /// Access a framebuffer for writing new content
    ///
    /// Fails with [`Error::BufferBusy`] while the framebuffer is scanned out.
    pub fn begin_write(&self, id: FramebufferId) -> Result<&Framebuffer, Error> {
        let entry = self.entry(id).ok_or(Error::UnknownFramebuffer)?;
        if entry.scanout_refs > 0 {
            return Err(Error::BufferBusy);
        }
        Ok(&entry.framebuffer)
    }

    /// Drop the producer reference
    pub fn release_producer(&mut self, id: FramebufferId) -> Result<(), Error> {
        let entry = self.entry_mut(id)?;
        entry.producer_refs = entry.producer_refs.saturating_sub(1);
        self.maybe_free(id);
        Ok(())
    }

    /// Reference the framebuffer from a scanout slot
    pub fn add_scanout_ref(&mut self, id: FramebufferId) -> Result<(), Error> {
        let entry = self.entry_mut(id)?;
        entry.scanout_refs += 1;
        Ok(())
    }

    /// Drop a scanout slot reference
    pub fn drop_scanout_ref(&mut self, id: FramebufferId) {
        if let Ok(entry) = self.entry_mut(id) {
            entry.scanout_refs = entry.scanout_refs.saturating_sub(1);
            self.maybe_free(id);
        }
    }

    fn maybe_free(&mut self, id: FramebufferId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        let (generation, handle) = match slot {
            Slot::Occupied { generation, entry } if entry.producer_refs == 0 && entry.scanout_refs == 0 => {
                (*generation, entry.framebuffer.handle)
            }
            _ => return,
        };
        trace!(fb = ?handle, "framebuffer released");
        *slot = Slot::Vacant {
            generation: generation + 1,
        };
        self.released.push(handle);
        self.free.push(id.index);
    }

    /// Kernel framebuffers no longer referenced by anyone, to be destroyed
    pub fn take_released(&mut self) -> Vec<framebuffer::Handle> {
        std::mem::take(&mut self.released)
    }
}

/// The `current` and `next` framebuffer of a crtc or plane
///
/// `next` is set before a commit and promoted to `current` once the kernel
/// reports the page-flip.
#[derive(Debug, Default)]
pub struct BufferSlots {
    current: Option<FramebufferId>,
    next: Option<FramebufferId>,
}

impl BufferSlots {
    /// Framebuffer scanned out right now
    pub fn current(&self) -> Option<FramebufferId> {
        self.current
    }

    /// Framebuffer waiting for the next page-flip
    pub fn next(&self) -> Option<FramebufferId> {
        self.next
    }

    /// Prepare a framebuffer for the next page-flip
    pub fn set_next(&mut self, arena: &mut Framebuffers, fb: FramebufferId) -> Result<(), Error> {
        if self.next == Some(fb) {
            return Ok(());
        }
        arena.add_scanout_ref(fb)?;
        if let Some(old) = self.next.replace(fb) {
            arena.drop_scanout_ref(old);
        }
        Ok(())
    }

    /// Replace the scanned out framebuffer without a flip
    pub fn set_current(&mut self, arena: &mut Framebuffers, fb: Option<FramebufferId>) -> Result<(), Error> {
        if self.current == fb {
            return Ok(());
        }
        if let Some(fb) = fb {
            arena.add_scanout_ref(fb)?;
        }
        if let Some(old) = std::mem::replace(&mut self.current, fb) {
            arena.drop_scanout_ref(old);
        }
        Ok(())
    }

    /// Promote `next` to `current`
    ///
    /// Without a `next` framebuffer this does nothing.
    pub fn flip_buffer(&mut self, arena: &mut Framebuffers) {
        let Some(next) = self.next.take() else {
            return;
        };
        if let Some(old) = self.current.replace(next) {
            arena.drop_scanout_ref(old);
        }
    }

    /// Drop a prepared framebuffer that will never be flipped
    pub fn discard_next(&mut self, arena: &mut Framebuffers) {
        if let Some(next) = self.next.take() {
            arena.drop_scanout_ref(next);
        }
    }

    /// Drop both slots
    pub fn release_buffers(&mut self, arena: &mut Framebuffers) {
        self.discard_next(arena);
        if let Some(current) = self.current.take() {
            arena.drop_scanout_ref(current);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BufferSlots, Framebuffer, Framebuffers};
    use crate::backend::drm::error::Error;
    use drm::control::from_u32;
    use drm_fourcc::{DrmFourcc, DrmModifier};

    fn fb(raw: u32) -> Framebuffer {
        Framebuffer {
            handle: from_u32(raw).unwrap(),
            size: (1920, 1080).into(),
            format: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::Linear,
        }
    }

    #[test]
    fn flip_without_next_is_noop() {
        let mut arena = Framebuffers::default();
        let mut slots = BufferSlots::default();
        slots.flip_buffer(&mut arena);
        slots.flip_buffer(&mut arena);
        assert_eq!(slots.current(), None);

        let a = arena.insert(fb(1));
        slots.set_next(&mut arena, a).unwrap();
        slots.flip_buffer(&mut arena);
        slots.flip_buffer(&mut arena);
        assert_eq!(slots.current(), Some(a));
        assert_eq!(slots.next(), None);
        assert!(arena.is_scanned_out(a));
    }

    #[test]
    fn scanned_out_buffers_are_not_writable() {
        let mut arena = Framebuffers::default();
        let mut slots = BufferSlots::default();
        let a = arena.insert(fb(1));
        assert!(arena.begin_write(a).is_ok());
        slots.set_next(&mut arena, a).unwrap();
        assert!(matches!(arena.begin_write(a), Err(Error::BufferBusy)));
        slots.flip_buffer(&mut arena);
        assert!(matches!(arena.begin_write(a), Err(Error::BufferBusy)));
        slots.release_buffers(&mut arena);
        assert!(arena.begin_write(a).is_ok());
    }

    #[test]
    fn released_only_without_references() {
        let mut arena = Framebuffers::default();
        let mut slots = BufferSlots::default();
        let a = arena.insert(fb(1));
        let b = arena.insert(fb(2));
        slots.set_next(&mut arena, a).unwrap();
        slots.flip_buffer(&mut arena);

        // the producer lets go while the buffer is still on screen
        arena.release_producer(a).unwrap();
        assert!(arena.contains(a));
        assert!(arena.take_released().is_empty());

        slots.set_next(&mut arena, b).unwrap();
        slots.flip_buffer(&mut arena);
        assert!(!arena.contains(a));
        assert_eq!(arena.take_released(), vec![fb(1).handle]);
        assert!(arena.contains(b));
    }

    #[test]
    fn stale_ids_are_rejected() {
        let mut arena = Framebuffers::default();
        let a = arena.insert(fb(1));
        arena.release_producer(a).unwrap();
        let b = arena.insert(fb(2));
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).map(|f| f.handle), Some(fb(2).handle));
        assert!(matches!(arena.begin_write(a), Err(Error::UnknownFramebuffer)));
        assert!(matches!(arena.release_producer(a), Err(Error::UnknownFramebuffer)));

        let mut slots = BufferSlots::default();
        slots.release_buffers(&mut arena);
        slots.release_buffers(&mut arena);
        assert_eq!(arena.len(), 1);
    }
}
