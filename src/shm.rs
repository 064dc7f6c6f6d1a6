//! Shared-memory framebuffer negotiation.
//!
//! Each session's pixel storage is a named POSIX shm region the client
//! maps into its own address space by the name we hand back during
//! negotiation. A region holds one or two `width * height * 4` planes;
//! with double buffering the front and back [`Surface`] views are
//! labels over the two halves and a swap just exchanges the labels.
//! Nothing is ever copied between planes.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd;
use thiserror::Error;
use tracing::warn;

/// Bits per pixel reported to clients. All surfaces are 32-bit.
pub const DEPTH: i32 = 32;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("creating shared memory {name}: {source}")]
    Create { name: String, source: Errno },
    #[error("sizing shared memory {name} to {len} bytes: {source}")]
    Resize {
        name: String,
        len: usize,
        source: Errno,
    },
    #[error("mapping shared memory {name}: {source}")]
    Map { name: String, source: Errno },
    #[error("rejecting framebuffer dimensions {width}x{height}")]
    BadDimensions { width: i32, height: i32 },
}

/// An owned, mapped, named shm region. Dropping it unmaps the memory
/// and unlinks the name.
pub struct ShmRegion {
    name: String,
    ptr: NonNull<c_void>,
    len: usize,
}

impl ShmRegion {
    /// Create a fresh region under `name`. The name must not already
    /// exist (`O_EXCL`); collisions are a hard failure, not a retry.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        debug_assert!(len > 0);
        let fd: OwnedFd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|source| ShmError::Create {
            name: name.to_string(),
            source,
        })?;

        if let Err(source) = unistd::ftruncate(&fd, len as i64) {
            let _ = mman::shm_unlink(name);
            return Err(ShmError::Resize {
                name: name.to_string(),
                len,
                source,
            });
        }

        // len > 0 is guaranteed by negotiate's dimension guards.
        let nz = NonZeroUsize::new(len).ok_or(ShmError::Map {
            name: name.to_string(),
            source: Errno::EINVAL,
        })?;
        let ptr = unsafe {
            mman::mmap(
                None,
                nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|source| {
            let _ = mman::shm_unlink(name);
            ShmError::Map {
                name: name.to_string(),
                source,
            }
        })?;

        // The fd is only needed for mapping; the mapping and the name
        // keep the region alive.
        drop(fd);

        Ok(ShmRegion {
            name: name.to_string(),
            ptr,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Err(err) = unsafe { mman::munmap(self.ptr, self.len) } {
            warn!(name = %self.name, %err, "munmap failed");
        }
        if let Err(err) = mman::shm_unlink(self.name.as_str()) {
            warn!(name = %self.name, %err, "shm_unlink failed");
        }
    }
}

/// A view over one plane of a region. Copyable label, not an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    offset: usize,
    width: i32,
    height: i32,
    pitch: i32,
}

impl Surface {
    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn pitch(&self) -> i32 {
        self.pitch
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A session's negotiated pixel storage: the shm region plus the
/// current front/back labelling.
pub struct Framebuffer {
    region: ShmRegion,
    front: Surface,
    back: Surface,
    double_buffered: bool,
}

impl Framebuffer {
    /// Create a framebuffer under `name`. With double buffering the
    /// region holds two planes and starts pre-swapped: the client draws
    /// into the first half while the second half is the initial front.
    /// On failure nothing is left behind, the caller's previous
    /// framebuffer (if any) is untouched.
    pub fn negotiate(
        name: &str,
        width: i32,
        height: i32,
        double_buffered: bool,
    ) -> Result<Self, ShmError> {
        if width <= 0 || height <= 0 {
            return Err(ShmError::BadDimensions { width, height });
        }
        let plane = (width as usize)
            .checked_mul(height as usize)
            .and_then(|p| p.checked_mul(BYTES_PER_PIXEL))
            .ok_or(ShmError::BadDimensions { width, height })?;
        let pitch = (width as usize)
            .checked_mul(BYTES_PER_PIXEL)
            .filter(|p| *p <= i32::MAX as usize)
            .ok_or(ShmError::BadDimensions { width, height })? as i32;
        let len = if double_buffered {
            plane.checked_mul(2).ok_or(ShmError::BadDimensions { width, height })?
        } else {
            plane
        };

        let region = ShmRegion::create(name, len)?;

        let first = Surface {
            offset: 0,
            width,
            height,
            pitch,
        };
        let second = Surface {
            offset: plane,
            ..first
        };
        let (front, back) = if double_buffered {
            (second, first)
        } else {
            (first, first)
        };

        Ok(Framebuffer {
            region,
            front,
            back,
            double_buffered,
        })
    }

    /// Exchange front and back labels. Single-buffered surfaces alias,
    /// so swapping is the identity there.
    pub fn swap(&mut self) {
        if self.double_buffered {
            std::mem::swap(&mut self.front, &mut self.back);
        }
    }

    pub fn front(&self) -> Surface {
        self.front
    }

    /// Base pointer of the front plane inside the mapping.
    pub fn front_ptr(&self) -> *const u8 {
        // offset is 0 or one plane, always inside the mapping.
        unsafe { self.region.as_ptr().add(self.front.offset) }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn double_buffered(&self) -> bool {
        self.double_buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/pixmux_test_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn double_buffered_planes_are_disjoint_and_preswapped() {
        let name = unique("dbl");
        let fb = Framebuffer::negotiate(&name, 32, 8, true).unwrap();
        assert_eq!(fb.front().pitch(), 128);
        // Front starts as the second half.
        assert_eq!(fb.front().offset(), 32 * 8 * 4);
        assert_eq!(fb.region.len(), 32 * 8 * 4 * 2);
    }

    #[test]
    fn single_buffered_front_is_whole_region() {
        let name = unique("sgl");
        let fb = Framebuffer::negotiate(&name, 16, 4, false).unwrap();
        assert_eq!(fb.front().offset(), 0);
        assert_eq!(fb.region.len(), 16 * 4 * 4);
        let mut fb = fb;
        let before = fb.front();
        fb.swap();
        assert_eq!(fb.front(), before);
    }

    #[test]
    fn swap_twice_is_identity() {
        let name = unique("swap");
        let mut fb = Framebuffer::negotiate(&name, 8, 8, true).unwrap();
        let start = fb.front();
        fb.swap();
        assert_ne!(fb.front(), start);
        fb.swap();
        assert_eq!(fb.front(), start);
    }

    #[test]
    fn rejects_degenerate_dimensions() {
        assert!(matches!(
            Framebuffer::negotiate("/pixmux_test_bad", 0, 10, false),
            Err(ShmError::BadDimensions { .. })
        ));
        assert!(matches!(
            Framebuffer::negotiate("/pixmux_test_bad", 10, -3, false),
            Err(ShmError::BadDimensions { .. })
        ));
    }

    #[test]
    fn duplicate_name_fails_and_leaves_original_alive() {
        let name = unique("dup");
        let first = Framebuffer::negotiate(&name, 8, 8, false).unwrap();
        let second = Framebuffer::negotiate(&name, 8, 8, false);
        assert!(matches!(second, Err(ShmError::Create { .. })));
        // The original mapping is still usable.
        unsafe {
            std::ptr::write_bytes(first.region.as_ptr(), 0x5a, first.region.len());
        }
    }
}
