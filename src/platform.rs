use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The heap only needs to
/// obtain backing memory for its area and for segment groups, and return it
/// at finalize, without caring about the APIs offered by the underlying
/// kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely. The returned address is at least page aligned, which
    /// satisfies the heap granule.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting from `address` to the underlying
    /// kernel. Always called with the exact values a previous
    /// [`PlatformSpecificMemory::request_memory`] succeeded with.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Convenience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-write memory, private to this process, not mapped to any
            // file. The kernel rounds the mapping up to whole pages, which is
            // fine: the heap only ever touches `length` bytes of it.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The region is still mapped. Nothing sensible to do about it
                // at finalize time; the pages stay with the process.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Unlike mmap, memory has to be both reserved and committed in
            // order to become usable. One call can do both.
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // Length 0 with MEM_RELEASE decommits and releases the whole
            // reservation in one call.
            let address = address.cast().as_ptr();

            if Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).is_err() {
                // Same situation as munmap failing on unix.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so system calls such as `mmap` are replaced
    //! with the global allocator. This also makes Miri report heap areas and
    //! segment groups that were never returned.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::{Pointer, ALIGNMENT};

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, ALIGNMENT).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
