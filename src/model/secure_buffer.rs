//! Page-locked, self-wiping memory for key bytes and entropy

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use tracing::warn;
use zeroize::Zeroize;

/// Scoped buffer for sensitive bytes
///
/// The allocation has a fixed length and is never reallocated, so the bytes
/// are never copied behind the caller's back. The pages are locked into RAM
/// when the platform allows it, and the content is zeroed before the memory
/// is released on every exit path, including unwinding.
///
/// The buffer can move to another thread but cannot be shared between
/// threads, and it cannot be cloned.
pub struct SecureBuffer {
    bytes: Box<[u8]>,
    locked: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl SecureBuffer {
    /// Allocate a zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        let mut bytes = vec![0u8; len].into_boxed_slice();
        let locked = lock_pages(&mut bytes);
        Self {
            bytes,
            locked,
            _not_sync: PhantomData,
        }
    }

    /// Allocate a buffer holding a copy of `src`
    ///
    /// The caller stays responsible for wiping `src`.
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new(src.len());
        buf.bytes.copy_from_slice(src);
        buf
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// View the content as a fixed-size array if the length matches
    pub fn as_array<const N: usize>(&self) -> Option<&[u8; N]> {
        self.bytes.as_ref().try_into().ok()
    }

    /// Whether the pages are locked in memory
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Zero the content without releasing the buffer
    pub fn wipe(&mut self) {
        Zeroize::zeroize(&mut self.bytes[..]);
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.wipe();
        if self.locked {
            unlock_pages(&mut self.bytes);
        }
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {}])", self.bytes.len())
    }
}

#[cfg(unix)]
fn lock_pages(bytes: &mut [u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    // SAFETY: the pointer and length describe a live allocation owned by the
    // caller for the whole call.
    let rc = unsafe { libc::mlock(bytes.as_ptr().cast::<libc::c_void>(), bytes.len()) };
    if rc != 0 {
        warn!(
            "mlock of {} bytes failed ({}); secure buffer may be swapped",
            bytes.len(),
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

#[cfg(unix)]
fn unlock_pages(bytes: &mut [u8]) {
    // SAFETY: same allocation that was passed to mlock in `lock_pages`.
    let rc = unsafe { libc::munlock(bytes.as_ptr().cast::<libc::c_void>(), bytes.len()) };
    if rc != 0 {
        warn!(
            "munlock failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn lock_pages(_bytes: &mut [u8]) -> bool {
    warn!("page locking not supported on this platform");
    false
}

#[cfg(not(unix))]
fn unlock_pages(_bytes: &mut [u8]) {}
