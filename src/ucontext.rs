//! Portable backend on top of the C library's `ucontext` continuations.
//!
//! `swapcontext` saves and restores the signal mask with a system call on
//! every switch, which makes this backend noticeably slower than the fast
//! one, but it works wherever glibc does.
//!
//! `makecontext` only forwards `int` arguments, so the entry function and
//! its argument are boxed into a [`Bootstrap`] record whose address is
//! passed as two 32-bit halves.

use std::ffi::c_void;

use crate::arch::EntryFn;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod imp {
    use std::cell::UnsafeCell;
    use std::ffi::{c_int, c_uint, c_void};

    use super::Bootstrap;
    use crate::arch::EntryFn;
    use crate::error::{fatal, ContextError};
    use crate::stack::Stack;

    pub const AVAILABLE: bool = true;

    extern "C" {
        fn getcontext(ucp: *mut libc::ucontext_t) -> c_int;
        fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(), argc: c_int, ...);
        fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> c_int;
    }

    /// A saved `ucontext_t` at a stable heap address. glibc keeps pointers
    /// into the structure itself, so it must never move once initialised.
    pub struct UContext {
        uc: Box<UnsafeCell<libc::ucontext_t>>,
        _boot: Option<Box<Bootstrap>>,
    }

    fn zeroed() -> Box<UnsafeCell<libc::ucontext_t>> {
        // SAFETY: ucontext_t is plain old data; all-zero is a valid
        // placeholder until getcontext or swapcontext fills it in.
        Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }))
    }

    impl UContext {
        pub fn bootstrap() -> Self {
            UContext {
                uc: zeroed(),
                _boot: None,
            }
        }

        pub unsafe fn new(stack: &Stack, entry: EntryFn, arg: *mut c_void) -> Result<Self, ContextError> {
            let uc = zeroed();
            if getcontext(uc.get()) != 0 {
                return Err(ContextError::last_os("getcontext"));
            }
            let boot = Box::new(Bootstrap { entry, arg });
            let ptr = &*boot as *const Bootstrap as u64;

            let raw = &mut *uc.get();
            raw.uc_link = std::ptr::null_mut();
            raw.uc_stack.ss_sp = stack.bottom().cast();
            raw.uc_stack.ss_size = stack.usable_size();
            raw.uc_stack.ss_flags = 0;

            let func: extern "C" fn(c_uint, c_uint) = portable_entry;
            makecontext(
                uc.get(),
                std::mem::transmute::<extern "C" fn(c_uint, c_uint), extern "C" fn()>(func),
                2,
                (ptr >> 32) as c_uint,
                ptr as c_uint,
            );
            Ok(UContext {
                uc,
                _boot: Some(boot),
            })
        }

        pub unsafe fn swap(&self, to: &UContext) {
            if swapcontext(self.uc.get(), to.uc.get()) != 0 {
                fatal(ContextError::last_os("swapcontext"));
            }
        }
    }

    extern "C" fn portable_entry(hi: c_uint, lo: c_uint) {
        let ptr = ((hi as u64) << 32 | lo as u64) as usize as *const Bootstrap;
        // SAFETY: the record is owned by the UContext being started, which
        // outlives the context's execution.
        let boot = unsafe { &*ptr };
        let (entry, arg) = (boot.entry, boot.arg);
        // SAFETY: entry functions never return.
        unsafe { entry(arg) }
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod imp {
    use std::ffi::c_void;

    use crate::arch::EntryFn;
    use crate::error::{fatal, ContextError};
    use crate::stack::Stack;

    pub const AVAILABLE: bool = false;

    pub struct UContext {
        _priv: (),
    }

    impl UContext {
        pub fn bootstrap() -> Self {
            UContext { _priv: () }
        }

        pub unsafe fn new(_stack: &Stack, _entry: EntryFn, _arg: *mut c_void) -> Result<Self, ContextError> {
            Err(ContextError::Unimplemented("ucontext on this platform"))
        }

        pub unsafe fn swap(&self, _to: &UContext) {
            fatal(ContextError::Unimplemented("ucontext on this platform"))
        }
    }
}

/// Whether the portable backend exists on this host.
pub const PORTABLE_SWITCH_AVAILABLE: bool = imp::AVAILABLE;

pub(crate) use imp::UContext;

#[cfg_attr(not(all(target_os = "linux", target_env = "gnu")), allow(dead_code))]
pub(crate) struct Bootstrap {
    entry: EntryFn,
    arg: *mut c_void,
}

