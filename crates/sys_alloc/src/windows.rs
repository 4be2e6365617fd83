use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` addresses are aligned to this value (typically
/// 64KB), which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

#[derive(Debug)]
pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    // Alignment the mapping was created with; Miri frees through
    // std::alloc and needs the original layout back.
    align: usize,
}

impl MmapInner {
    /// Creates an anonymous mapping of `len` bytes whose start address is a
    /// multiple of `align`.
    ///
    /// `VirtualFree(MEM_RELEASE)` cannot trim a reservation, so alignments
    /// beyond the allocation granularity are satisfied by reserving an
    /// over-sized block to discover an aligned address, releasing it, and
    /// committing at that address. Another thread can steal the range
    /// between release and commit, so the probe retries a few times.
    pub unsafe fn map_anon_aligned(
        len: usize,
        align: usize,
        _populate: bool,
        _no_reserve: bool,
    ) -> io::Result<MmapInner> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc, Layout};
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(MmapInner {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
                align,
            })
        }
        #[cfg(not(miri))]
        {
            if align <= allocation_granularity() {
                let ptr = unsafe {
                    VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
                };
                if ptr.is_null() {
                    return Err(Error::last_os_error());
                }
                return Ok(MmapInner { ptr, len, align });
            }

            let over_len = len
                .checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

            for _ in 0..16 {
                let probe = unsafe {
                    VirtualAlloc(ptr::null(), over_len, MEM_RESERVE, PAGE_READWRITE)
                };
                if probe.is_null() {
                    return Err(Error::last_os_error());
                }

                let aligned = (probe as usize + align - 1) & !(align - 1);
                unsafe {
                    VirtualFree(probe, 0, MEM_RELEASE);
                }

                let ptr = unsafe {
                    VirtualAlloc(
                        aligned as *const std::ffi::c_void,
                        len,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(MmapInner { ptr, len, align });
                }
            }

            Err(Error::new(
                io::ErrorKind::OutOfMemory,
                "could not place aligned mapping",
            ))
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, self.align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    let _ = self.align;
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
