//! Re-usable set of dumb framebuffers of one size and format
//!
//! The swapchain allocates framebuffers lazily, up to its capacity, and hands out the
//! first one that is neither acquired for rendering nor referenced by a crtc or plane.
//! Resizing releases all buffers, framebuffers still on screen are destroyed once the
//! kernel flipped away from them.

use drm::control::framebuffer;
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, trace};

use super::{
    device::KmsDevice,
    error::{access, Error},
    framebuffer::{Framebuffer, FramebufferId, Framebuffers},
};
use crate::utils::{Physical, Size};

#[derive(Debug, Clone, Copy)]
struct Slot {
    fb: FramebufferId,
    age: u8,
    acquired: bool,
}

/// A framebuffer acquired for rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    /// Id of the framebuffer in the arena
    pub framebuffer: FramebufferId,
    /// Kernel handle of the framebuffer
    pub handle: framebuffer::Handle,
    /// Size in pixels
    pub size: Size<u32, Physical>,
    /// Pixel format
    pub format: DrmFourcc,
    /// Number of presents since this buffer was last presented, `0` for undefined content
    pub age: u8,
}

/// Swapchain of dumb framebuffers
#[derive(Debug)]
pub struct Swapchain {
    size: Size<u32, Physical>,
    format: DrmFourcc,
    capacity: usize,
    slots: Vec<Slot>,
}

impl Swapchain {
    /// Create an empty swapchain, no framebuffer is allocated until [`Swapchain::acquire`]
    pub fn new(size: Size<u32, Physical>, format: DrmFourcc, capacity: usize) -> Swapchain {
        Swapchain {
            size,
            format,
            capacity: capacity.max(1),
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Size of newly allocated framebuffers
    pub fn size(&self) -> Size<u32, Physical> {
        self.size
    }

    /// Format of the framebuffers
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Maximum number of framebuffers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the framebuffer belongs to this swapchain
    pub fn contains(&self, fb: FramebufferId) -> bool {
        self.slots.iter().any(|s| s.fb == fb)
    }

    /// Acquire a free framebuffer for rendering
    ///
    /// Fails with [`Error::NoFreeSlots`] if every framebuffer is acquired or on screen
    /// and the capacity is exhausted.
    pub fn acquire<D: KmsDevice + ?Sized>(
        &mut self,
        device: &D,
        arena: &mut Framebuffers,
    ) -> Result<RenderTarget, Error> {
        // drop slots whose framebuffer was torn down underneath us
        self.slots.retain(|s| arena.contains(s.fb));

        let index = match self
            .slots
            .iter()
            .position(|s| !s.acquired && !arena.is_scanned_out(s.fb))
        {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                let handle = device
                    .create_dumb_framebuffer(self.size, self.format)
                    .map_err(access("Failed to allocate framebuffer", device.dev_path()))?;
                let fb = arena.insert(Framebuffer {
                    handle,
                    size: self.size,
                    format: self.format,
                    modifier: DrmModifier::Linear,
                });
                trace!(?handle, size = ?self.size, "allocated framebuffer");
                self.slots.push(Slot {
                    fb,
                    age: 0,
                    acquired: false,
                });
                self.slots.len() - 1
            }
            None => return Err(Error::NoFreeSlots),
        };

        let slot = &mut self.slots[index];
        slot.acquired = true;
        let framebuffer = arena.get(slot.fb).ok_or(Error::UnknownFramebuffer)?;
        Ok(RenderTarget {
            framebuffer: slot.fb,
            handle: framebuffer.handle,
            size: framebuffer.size,
            format: framebuffer.format,
            age: slot.age,
        })
    }

    /// Mark an acquired framebuffer as presented
    ///
    /// Ages all other framebuffers with defined content by one.
    pub fn submitted(&mut self, fb: FramebufferId) {
        for slot in &mut self.slots {
            if slot.fb == fb {
                slot.age = 1;
                slot.acquired = false;
            } else if slot.age > 0 {
                slot.age = slot.age.saturating_add(1);
            }
        }
    }

    /// Return an acquired framebuffer that was never presented
    pub fn discard(&mut self, fb: FramebufferId) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.fb == fb) {
            slot.acquired = false;
            slot.age = 0;
        }
    }

    /// Change the size of future framebuffers, releasing the current ones
    pub fn resize(&mut self, arena: &mut Framebuffers, size: Size<u32, Physical>) {
        if self.size == size {
            return;
        }
        self.release_all(arena);
        self.size = size;
    }

    /// Drop all framebuffers
    ///
    /// Framebuffers still on screen stay alive until their scanout slot lets go of them.
    pub fn release_all(&mut self, arena: &mut Framebuffers) {
        for slot in self.slots.drain(..) {
            if let Err(err) = arena.release_producer(slot.fb) {
                debug!(fb = ?slot.fb, ?err, "swapchain framebuffer already gone");
            }
        }
    }
}
