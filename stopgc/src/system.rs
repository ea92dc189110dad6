//! Operating system plumbing: address space reservation, page decommit,
//! stack bounds and the register/stack-pointer capture used by the
//! suspension protocol.

use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_NORESERVE: i32 = 0x0;

    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and madvise
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// posix memory reservation using mmap
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// gives the pages back to the OS, the mapping itself stays valid
    /// # Safety
    /// must be a page aligned range inside an mmap allocation
    #[inline]
    pub unsafe fn anonymous_decommit(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Number of machine words captured by [`spill_registers`].
pub const SPILL_WORDS: usize = 12;

#[cfg(unix)]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

#[cfg(unix)]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Returns the physical pages backing `[ptr, ptr + size)` to the OS.
/// The range stays addressable and reads back as zero on Linux.
#[cfg(unix)]
pub fn decommit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: callers only pass block ranges inside the heap reservation
    unsafe { unix::anonymous_decommit(ptr.as_ptr(), size) }
}

#[cfg(not(unix))]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    let layout =
        std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE).ok()?;
    if layout.size() == 0 {
        return None;
    }
    // SAFETY: layout has a non-zero size
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

#[cfg(not(unix))]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    if let Ok(layout) = std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE)
    {
        // SAFETY: ptr was returned by map_memory with the same layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(not(unix))]
pub fn decommit_memory(_ptr: NonNull<u8>, _size: usize) -> bool {
    false
}

// ── Stacks and registers ──────────────────────────────────────────────

/// Approximates the current stack pointer.
///
/// The returned address lies in the frame of this function, which is below
/// (deeper than) every frame of its caller.
#[inline(never)]
pub fn approx_sp() -> usize {
    let marker = 0usize;
    std::hint::black_box(&marker) as *const usize as usize
}

/// Stores the callee-saved registers into `out`.
///
/// Pointers that live only in registers at a safepoint are made visible to
/// the conservative scan this way. Unsupported architectures leave `out`
/// zeroed and rely on the callers' frames alone.
#[inline(never)]
pub fn spill_registers(out: &mut [usize; SPILL_WORDS]) {
    *out = [0; SPILL_WORDS];

    #[cfg(target_arch = "x86_64")]
    // SAFETY: only writes six words into `out`
    unsafe {
        std::arch::asm!(
            "mov qword ptr [{p}], rbx",
            "mov qword ptr [{p} + 8], rbp",
            "mov qword ptr [{p} + 16], r12",
            "mov qword ptr [{p} + 24], r13",
            "mov qword ptr [{p} + 32], r14",
            "mov qword ptr [{p} + 40], r15",
            p = in(reg) out.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    #[cfg(target_arch = "aarch64")]
    // SAFETY: only writes eleven words into `out`
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{p}]",
            "stp x21, x22, [{p}, #16]",
            "stp x23, x24, [{p}, #32]",
            "stp x25, x26, [{p}, #48]",
            "stp x27, x28, [{p}, #64]",
            "str x29, [{p}, #80]",
            p = in(reg) out.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    std::hint::black_box(out);
}

/// Address range of the current thread's stack. Stacks grow down, so
/// `base` is the highest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub base: usize,
    pub limit: usize,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // SAFETY: attr is initialized by pthread_getattr_np before use and
    // destroyed afterwards
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        let limit = addr as usize;
        Some(StackBounds {
            base: limit + size,
            limit,
        })
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // SAFETY: both calls only inspect the calling thread
    unsafe {
        let this = libc::pthread_self();
        let base = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        if base == 0 {
            return None;
        }
        Some(StackBounds {
            base,
            limit: base - size,
        })
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}
