//! Stack overflow reporting.
//!
//! Every logical-thread stack sits above a `PROT_NONE` guard region, so an
//! overflow faults instead of corrupting the neighbouring mapping. The
//! handler installed here runs on a per-thread alternate signal stack (the
//! faulting stack is unusable), prints a one-line diagnostic and lets the
//! default action kill the process.

use crate::error::ContextError;

#[cfg(target_os = "linux")]
mod imp {
    use std::cell::RefCell;
    use std::ptr::NonNull;
    use std::sync::OnceLock;

    use crate::error::ContextError;
    use crate::fmt::FmtBytes;

    /// Invalid permissions for a mapped object, which is what a guard page
    /// hit looks like.
    const SEGV_ACCERR: libc::c_int = 2;

    const ALT_STACK_SIZE: usize = 64 * 1024;

    /// Pre-rendered diagnostic. The handler may not allocate.
    static MESSAGE: OnceLock<Vec<u8>> = OnceLock::new();

    struct AltStack {
        base: NonNull<libc::c_void>,
    }

    impl Drop for AltStack {
        fn drop(&mut self) {
            let ss = libc::stack_t {
                ss_sp: std::ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            // SAFETY: disabling first so the kernel never delivers onto an
            // unmapped alternate stack.
            unsafe {
                libc::sigaltstack(&ss, std::ptr::null_mut());
                libc::munmap(self.base.as_ptr(), ALT_STACK_SIZE);
            }
        }
    }

    thread_local! {
        static ALT_STACK: RefCell<Option<AltStack>> = const { RefCell::new(None) };
    }

    pub(super) fn install(stack_size: usize) -> Result<(), ContextError> {
        MESSAGE.get_or_init(|| {
            format!(
                "fatal: stack overflow in a logical thread (stack size {}); \
                 raise SCX_CTX_STACK_SIZE\n",
                FmtBytes(stack_size as u64)
            )
            .into_bytes()
        });

        for signal in [libc::SIGSEGV, libc::SIGBUS] {
            // SAFETY: zeroed sigaction is a valid "no flags, empty mask"
            // value; the handler only calls async-signal-safe functions.
            let ret = unsafe {
                let mut sa: libc::sigaction = std::mem::zeroed();
                sa.sa_sigaction = overflow_handler as *const () as libc::sighandler_t;
                sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESETHAND;
                libc::sigemptyset(&mut sa.sa_mask);
                libc::sigaction(signal, &sa, std::ptr::null_mut())
            };
            if ret != 0 {
                return Err(ContextError::last_os("sigaction"));
            }
        }
        init_thread();
        tracing::debug!("stack overflow reporter installed");
        Ok(())
    }

    pub(super) fn init_thread() {
        ALT_STACK.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return;
            }
            // SAFETY: fresh anonymous mapping owned by this thread.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    ALT_STACK_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                tracing::warn!(error = %ContextError::last_os("mmap"), "no alternate signal stack");
                return;
            }
            let Some(base) = NonNull::new(base) else {
                return;
            };
            let ss = libc::stack_t {
                ss_sp: base.as_ptr(),
                ss_flags: 0,
                ss_size: ALT_STACK_SIZE,
            };
            // SAFETY: `ss` describes the mapping above.
            if unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) } != 0 {
                tracing::warn!(error = %ContextError::last_os("sigaltstack"), "no alternate signal stack");
                // SAFETY: not installed, nothing refers to it.
                unsafe { libc::munmap(base.as_ptr(), ALT_STACK_SIZE) };
                return;
            }
            *slot = Some(AltStack { base });
        });
    }

    pub(super) fn has_alt_stack() -> bool {
        ALT_STACK.with(|slot| slot.borrow().is_some())
    }

    extern "C" fn overflow_handler(
        _signal: libc::c_int,
        info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
        // SAFETY: the kernel hands a valid siginfo for SA_SIGINFO handlers.
        let code = unsafe { (*info).si_code };
        if code != SEGV_ACCERR {
            return;
        }
        if let Some(msg) = MESSAGE.get() {
            // SAFETY: write(2) is async-signal-safe; the buffer is static.
            unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
        }
        // Returning re-executes the faulting access under SIG_DFL.
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use crate::error::ContextError;

    pub(super) fn install(_stack_size: usize) -> Result<(), ContextError> {
        tracing::warn!("stack overflow reporting is only implemented on Linux");
        Ok(())
    }

    pub(super) fn init_thread() {}

    pub(super) fn has_alt_stack() -> bool {
        false
    }
}

/// Install the process-wide overflow reporter for stacks of `stack_size`
/// bytes, and an alternate signal stack on the calling thread.
pub fn install(stack_size: usize) -> Result<(), ContextError> {
    imp::install(stack_size)
}

/// Give the calling OS thread an alternate signal stack. Idempotent; the
/// stack is released when the thread exits.
pub fn init_thread() {
    imp::init_thread()
}

/// Whether the calling thread has an alternate signal stack from
/// [`init_thread`].
pub fn has_alt_stack() -> bool {
    imp::has_alt_stack()
}
