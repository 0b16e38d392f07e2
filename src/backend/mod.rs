//! Backend helpers
//!
//! Collection of the parts interacting with the graphics hardware of the system.
//!
//! Currently the only backend is [`drm`], driving displays through the atomic
//! kernel modesetting api.

pub mod drm;
