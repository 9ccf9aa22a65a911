//! Hand-written register switch for the fast backend.
//!
//! A suspended fast context is nothing but a stack pointer: the switch
//! routine pushes the callee-saved registers onto the running stack, stores
//! the resulting stack pointer, loads the other one and pops. A fresh
//! context gets a synthetic frame whose "return address" is a bootstrap stub
//! that calls the entry function with its argument.
//!
//! Hosts without an implementation get stubs that abort; the factory never
//! selects them because [`FAST_SWITCH_AVAILABLE`] is false there.

use std::ffi::c_void;

/// Entry point of a fresh context. Must never return.
pub type EntryFn = unsafe extern "C" fn(arg: *mut c_void) -> !;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
use self::x86_64 as imp;

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
use self::aarch64 as imp;

#[cfg(not(any(
    all(target_arch = "x86_64", target_os = "linux"),
    all(target_arch = "aarch64", target_os = "linux")
)))]
mod imp {
    use super::EntryFn;
    use crate::error::{fatal, ContextError};
    use std::ffi::c_void;

    pub const AVAILABLE: bool = false;

    pub unsafe fn prepare(_top: *mut u8, _entry: EntryFn, _arg: *mut c_void) -> *mut u8 {
        fatal(ContextError::Unimplemented(
            "fast context creation on this architecture",
        ))
    }

    pub unsafe fn swap(_save: *mut *mut u8, _restore: *mut u8) {
        fatal(ContextError::Unimplemented(
            "fast context switch on this architecture",
        ))
    }
}

/// Whether the fast backend exists on this host.
pub const FAST_SWITCH_AVAILABLE: bool = imp::AVAILABLE;

/// Build the initial frame for `entry(arg)` below `top` and return the
/// stack pointer to resume it with.
///
/// # Safety
///
/// `top` must be the upper end of a writable region large enough for the
/// frame and for everything `entry` will run.
pub unsafe fn prepare(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> *mut u8 {
    imp::prepare(top, entry, arg)
}

/// Save the running context's stack pointer into `*save` and resume the
/// context suspended at `restore`.
///
/// Returns when another switch resumes the saved stack pointer.
///
/// # Safety
///
/// `restore` must come from [`prepare`] or from an earlier `swap` and must
/// not be running on any thread.
#[inline(always)]
pub unsafe fn swap(save: *mut *mut u8, restore: *mut u8) {
    imp::swap(save, restore)
}
