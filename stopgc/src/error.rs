use thiserror::Error;

/// An allocation request that could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("allocation of {requested} bytes overflows the address space")]
    SizeOverflow { requested: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RootError {
    #[error("invalid root range {start:#x}..{end:#x}")]
    InvalidRange { start: usize, end: usize },
    #[error("root range {start:#x}..{end:#x} is not registered")]
    NotRegistered { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("thread is already registered with this collector")]
    AlreadyRegistered,
    #[error("could not determine the stack bounds of the current thread")]
    StackBounds,
    #[error("thread is already registered with another signal-backed collector")]
    SignalSlotTaken,
    #[error("suspend backend refused the thread: {0}")]
    Backend(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("invalid collector settings: {0}")]
    Settings(&'static str),
    #[error("could not reserve {0} bytes of address space")]
    Reserve(usize),
}

/// Conditions after which heap consistency can no longer be guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error(
        "thread {thread} did not acknowledge suspension for epoch {epoch} \
         within {waited_ms} ms"
    )]
    SuspendTimeout {
        thread: u64,
        epoch: u64,
        waited_ms: u128,
    },
    #[error("heap corruption detected at {addr:#x}: {detail}")]
    CorruptionDetected { detail: &'static str, addr: usize },
}

/// Reports `err` and aborts the process.
///
/// Unwinding is not an option here: other threads may be parked inside
/// the suspend protocol and the heap may be half marked.
#[cold]
#[inline(never)]
pub fn fatal(err: Fatal) -> ! {
    log::error!("fatal collector error: {err}");
    std::process::abort()
}

/// [`fatal`] for callers that have other threads stopped. A stopped thread
/// may hold the logger's or the allocator's lock, so the message is
/// formatted into a stack buffer and written straight to stderr.
#[cold]
#[inline(never)]
pub fn fatal_stopped(err: Fatal) -> ! {
    use std::io::Write;

    let mut buf = [0u8; 256];
    let len = {
        let mut cursor = &mut buf[..];
        let _ = writeln!(cursor, "fatal collector error: {err}");
        256 - cursor.len()
    };
    #[cfg(unix)]
    // SAFETY: writes `len` initialized bytes of `buf` to fd 2
    unsafe {
        libc::write(2, buf.as_ptr().cast(), len);
    }
    #[cfg(not(unix))]
    let _ = std::io::stderr().write_all(&buf[..len]);
    std::process::abort()
}
