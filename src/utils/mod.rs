//! Various utilities functions and types

mod geometry;

pub use self::geometry::{Coordinate, Logical, Physical, Point, Rectangle, Size, Transform};

use std::path::PathBuf;

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

#[cfg(feature = "backend_drm")]
impl<A: std::os::unix::io::AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        use std::os::unix::io::AsRawFd;

        std::fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}
