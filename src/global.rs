//! Process-default heap instance behind the classical malloc signatures.
//!
//! The engine itself reports failure through `Result`; this module adds the
//! errno-style integer channel callers of the raw API expect.  The channel
//! is set when an allocation fails for lack of memory and only ever cleared
//! by the caller.

use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin::Mutex;

use crate::heap::{AllocError, Heap, DEFAULT_HEAP_SIZE};

static HEAP: Mutex<Heap<DEFAULT_HEAP_SIZE>> = Mutex::new(Heap::new());
static ALLOC_ERRNO: AtomicI32 = AtomicI32::new(0);

/// Error codes reported through the signalling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Errno {
    NoMem = 12,
}

fn signal(err: AllocError) {
    if err == AllocError::HeapExhausted {
        ALLOC_ERRNO.store(Errno::NoMem.into(), Ordering::Relaxed);
    }
}

/// Last signalled error, if any.
pub fn last_error() -> Option<Errno> {
    Errno::try_from(ALLOC_ERRNO.load(Ordering::Relaxed)).ok()
}

pub fn clear_error() {
    ALLOC_ERRNO.store(0, Ordering::Relaxed);
}

/// Allocate `size` bytes from the process-default heap.  Null on failure;
/// out-of-memory additionally signals [`Errno::NoMem`].
pub fn malloc(size: u32) -> *mut u8 {
    match HEAP.lock().allocate(size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(err) => {
            signal(err);
            ptr::null_mut()
        }
    }
}

/// Free a block previously returned by [`malloc`] or [`realloc`].
///
/// # Panics
/// Panics on an invalid pointer.
pub fn free(ptr: *mut u8) {
    HEAP.lock().free(ptr);
}

/// Resize a block.  Null is returned when `rsize` is zero (the block was
/// freed) or when a larger block could not be obtained; in the latter case
/// the original block is untouched and [`Errno::NoMem`] is signalled.
///
/// # Panics
/// Panics on an invalid pointer.
pub fn realloc(ptr: *mut u8, rsize: u32) -> *mut u8 {
    match HEAP.lock().reallocate(ptr, rsize) {
        Ok(Some(ptr)) => ptr.as_ptr(),
        Ok(None) => ptr::null_mut(),
        Err(err) => {
            signal(err);
            ptr::null_mut()
        }
    }
}

pub fn internal_fragmentation() -> f64 {
    HEAP.lock().internal_fragmentation()
}

pub fn utilization() -> f64 {
    HEAP.lock().utilization()
}

pub fn peak_utilization() -> f64 {
    HEAP.lock().peak_utilization()
}

/// Replace the header obfuscation mask of the process-default heap.  Must
/// precede the first allocation.
pub fn set_magic(magic: u64) {
    HEAP.lock().set_magic(magic);
}
