//! x86_64 System V switch.
//!
//! Saved frame, from the saved stack pointer upwards:
//! `r15 r14 r13 r12 rbx rbp ret`.

use std::ffi::c_void;

use super::EntryFn;

pub const AVAILABLE: bool = true;

std::arch::global_asm!(
    ".text",
    ".global scx_ctx_raw_swap",
    ".type scx_ctx_raw_swap, @function",
    ".p2align 4",
    "scx_ctx_raw_swap:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov qword ptr [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size scx_ctx_raw_swap, .-scx_ctx_raw_swap",
    "",
    ".global scx_ctx_raw_bootstrap",
    ".type scx_ctx_raw_bootstrap, @function",
    ".p2align 4",
    "scx_ctx_raw_bootstrap:",
    ".cfi_startproc",
    ".cfi_undefined rip",
    "mov rdi, r12",
    "call r13",
    "ud2",
    ".cfi_endproc",
    ".size scx_ctx_raw_bootstrap, .-scx_ctx_raw_bootstrap",
);

extern "C" {
    fn scx_ctx_raw_swap(save: *mut *mut u8, restore: *mut u8);
    fn scx_ctx_raw_bootstrap();
}

const FRAME_WORDS: usize = 9;
const SLOT_R13: usize = 2;
const SLOT_R12: usize = 3;
const SLOT_RET: usize = 6;

pub unsafe fn prepare(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> *mut u8 {
    // rsp must be 16-byte aligned at the `call` in the bootstrap stub, which
    // runs after the six pops and the `ret`.
    let top = (top as usize) & !15;
    let sp = (top - FRAME_WORDS * 8) as *mut usize;
    for i in 0..FRAME_WORDS {
        sp.add(i).write(0);
    }
    sp.add(SLOT_R13).write(entry as usize);
    sp.add(SLOT_R12).write(arg as usize);
    sp.add(SLOT_RET).write(scx_ctx_raw_bootstrap as usize);
    sp.cast()
}

#[inline(always)]
pub unsafe fn swap(save: *mut *mut u8, restore: *mut u8) {
    scx_ctx_raw_swap(save, restore)
}
