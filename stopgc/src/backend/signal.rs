//! POSIX signal handshake.
//!
//! The coordinator sends `SIG_SUSPEND` with `pthread_kill`. The handler
//! saves a snapshot, acknowledges the requested epoch and sleeps in
//! `sigsuspend` until the coordinator publishes a matching resume epoch
//! and sends `SIG_RESTART`. The handler runs on the thread's own stack, so
//! the interrupted register context that the kernel pushed lies inside the
//! scanned `[sp, base)` range.

use std::{
    cell::Cell,
    mem, ptr,
    sync::{Arc, OnceLock, atomic::Ordering},
};

use libc::c_int;

use super::{Delivery, SuspendBackend};
use crate::{
    error::RegisterError,
    threads::{ThreadRecord, ThreadState},
};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SIG_SUSPEND: c_int = libc::SIGPWR;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SIG_SUSPEND: c_int = libc::SIGXCPU;

pub const SIG_RESTART: c_int = libc::SIGXFSZ;

thread_local! {
    /// Record the suspend handler acknowledges for. Const-initialized and
    /// without destructor, so reading it is async-signal-safe.
    static SIGNAL_RECORD: Cell<*const ThreadRecord> =
        const { Cell::new(ptr::null()) };
}

static INSTALLED: OnceLock<Result<(), &'static str>> = OnceLock::new();

/// Proof that the process-wide handlers are installed.
#[derive(Debug)]
pub struct Signal(());

impl Signal {
    /// Installs the process-wide handlers on first use.
    pub fn install() -> Result<Self, &'static str> {
        (*INSTALLED.get_or_init(install_handlers)).map(|()| Self(()))
    }
}

fn install_handlers() -> Result<(), &'static str> {
    // SAFETY: the actions are fully initialized before being installed and
    // both handlers only use async-signal-safe operations
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = suspend_handler
            as extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaddset(&mut action.sa_mask, SIG_SUSPEND);
        libc::sigaddset(&mut action.sa_mask, SIG_RESTART);
        if libc::sigaction(SIG_SUSPEND, &action, ptr::null_mut()) != 0 {
            return Err("sigaction failed for the suspend signal");
        }

        let mut restart: libc::sigaction = mem::zeroed();
        restart.sa_sigaction = restart_handler
            as extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as libc::sighandler_t;
        restart.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut restart.sa_mask);
        if libc::sigaction(SIG_RESTART, &restart, ptr::null_mut()) != 0 {
            return Err("sigaction failed for the restart signal");
        }
    }
    log::debug!(
        "installed suspend handler on signal {SIG_SUSPEND}, restart on {SIG_RESTART}"
    );
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    // SAFETY: always valid for the calling thread
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
unsafe fn errno_location() -> *mut c_int {
    // SAFETY: always valid for the calling thread
    unsafe { libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
unsafe fn errno_location() -> *mut c_int {
    ptr::null_mut()
}

extern "C" fn suspend_handler(
    _sig: c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // SAFETY: errno_location returns the calling thread's errno or null
    let errno = unsafe { errno_location() };
    let saved_errno = if errno.is_null() {
        0
    } else {
        // SAFETY: non-null errno pointer of this thread
        unsafe { *errno }
    };

    let record = SIGNAL_RECORD.with(|slot| slot.get());
    if !record.is_null() {
        // SAFETY: the pointer is set by `attach` and cleared by `detach`
        // before the owning Arc can be dropped
        let record = unsafe { &*record };
        acknowledge(record);
    }

    if !errno.is_null() {
        // SAFETY: see above
        unsafe { *errno = saved_errno };
    }
}

fn acknowledge(record: &ThreadRecord) {
    // late retry after the thread already parked or was released
    if record.state() != ThreadState::SuspendRequested {
        return;
    }
    record.capture();
    if record
        .try_transition(ThreadState::SuspendRequested, ThreadState::Suspended)
        .is_err()
    {
        record.clear_snapshot();
        return;
    }
    // published before the request, read after winning it
    let epoch = record.requested_epoch.load(Ordering::Acquire);
    record.ack_epoch.store(epoch, Ordering::Release);

    // SAFETY: sigset operations on a local set
    let mask = unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::sigdelset(&mut mask, SIG_RESTART);
        libc::sigdelset(&mut mask, libc::SIGINT);
        libc::sigdelset(&mut mask, libc::SIGQUIT);
        libc::sigdelset(&mut mask, libc::SIGTERM);
        libc::sigdelset(&mut mask, libc::SIGABRT);
        mask
    };
    while record.resume_epoch.load(Ordering::Acquire) < epoch {
        // SAFETY: SIG_RESTART is blocked while the handler runs, so a
        // restart sent before this point stays pending and ends the wait
        unsafe { libc::sigsuspend(&mask) };
    }

    record.clear_snapshot();
    let _ = record.try_transition(ThreadState::Resuming, ThreadState::Running);
}

extern "C" fn restart_handler(
    _sig: c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
}

fn send(record: &ThreadRecord, sig: c_int) -> Delivery {
    // SAFETY: the handle belongs to a registered thread. Threads leave the
    // registry before they exit (when the mutator is dropped, or from a
    // thread-local destructor), and leaving waits for the running stop, so
    // the thread is alive until the stop has sent its last signal
    match unsafe { libc::pthread_kill(record.handle, sig) } {
        0 => Delivery::Delivered,
        _ => Delivery::Gone,
    }
}

impl SuspendBackend for Signal {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn attach(&self, record: &Arc<ThreadRecord>) -> Result<(), RegisterError> {
        SIGNAL_RECORD.with(|slot| {
            if !slot.get().is_null() {
                return Err(RegisterError::SignalSlotTaken);
            }
            slot.set(Arc::as_ptr(record));
            Ok(())
        })?;

        // SAFETY: only adjusts the calling thread's mask
        let rc = unsafe {
            let mut unblock: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut unblock);
            libc::sigaddset(&mut unblock, SIG_SUSPEND);
            libc::sigaddset(&mut unblock, SIG_RESTART);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &unblock, ptr::null_mut())
        };
        if rc != 0 {
            SIGNAL_RECORD.with(|slot| slot.set(ptr::null()));
            return Err(RegisterError::Backend("pthread_sigmask failed"));
        }
        Ok(())
    }

    fn detach(&self, record: &ThreadRecord) {
        let _ = SIGNAL_RECORD.try_with(|slot| {
            if ptr::eq(slot.get(), record) {
                slot.set(ptr::null());
            }
        });
    }

    fn request_suspend(&self, record: &ThreadRecord) -> Delivery {
        send(record, SIG_SUSPEND)
    }

    fn resume(&self, record: &ThreadRecord) {
        let _ = send(record, SIG_RESTART);
    }

    fn needs_polling(&self) -> bool {
        false
    }

    fn mask_requests(&self) {
        set_suspend_mask(libc::SIG_BLOCK);
    }

    fn unmask_requests(&self) {
        set_suspend_mask(libc::SIG_UNBLOCK);
    }
}

fn set_suspend_mask(how: c_int) {
    // SAFETY: only adjusts the calling thread's mask; pthread_sigmask is
    // async-signal-safe
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, SIG_SUSPEND);
        libc::pthread_sigmask(how, &set, ptr::null_mut());
    }
}
