//! AArch64 AAPCS64 switch.
//!
//! Saved frame (0xb0 bytes): d8-d15 at 0x00, x19-x28 at 0x40, x29/x30 at
//! 0x90.

use std::ffi::c_void;

use super::EntryFn;

pub const AVAILABLE: bool = true;

std::arch::global_asm!(
    ".text",
    ".global scx_ctx_raw_swap",
    ".type scx_ctx_raw_swap, %function",
    ".p2align 4",
    "scx_ctx_raw_swap:",
    "sub sp, sp, #0xb0",
    "stp d8, d9, [sp, #0x00]",
    "stp d10, d11, [sp, #0x10]",
    "stp d12, d13, [sp, #0x20]",
    "stp d14, d15, [sp, #0x30]",
    "stp x19, x20, [sp, #0x40]",
    "stp x21, x22, [sp, #0x50]",
    "stp x23, x24, [sp, #0x60]",
    "stp x25, x26, [sp, #0x70]",
    "stp x27, x28, [sp, #0x80]",
    "stp x29, x30, [sp, #0x90]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "ldp d8, d9, [sp, #0x00]",
    "ldp d10, d11, [sp, #0x10]",
    "ldp d12, d13, [sp, #0x20]",
    "ldp d14, d15, [sp, #0x30]",
    "ldp x19, x20, [sp, #0x40]",
    "ldp x21, x22, [sp, #0x50]",
    "ldp x23, x24, [sp, #0x60]",
    "ldp x25, x26, [sp, #0x70]",
    "ldp x27, x28, [sp, #0x80]",
    "ldp x29, x30, [sp, #0x90]",
    "add sp, sp, #0xb0",
    "ret",
    ".size scx_ctx_raw_swap, .-scx_ctx_raw_swap",
    "",
    ".global scx_ctx_raw_bootstrap",
    ".type scx_ctx_raw_bootstrap, %function",
    ".p2align 4",
    "scx_ctx_raw_bootstrap:",
    ".cfi_startproc",
    ".cfi_undefined x30",
    "mov x0, x19",
    "blr x20",
    "brk #0",
    ".cfi_endproc",
    ".size scx_ctx_raw_bootstrap, .-scx_ctx_raw_bootstrap",
);

extern "C" {
    fn scx_ctx_raw_swap(save: *mut *mut u8, restore: *mut u8);
    fn scx_ctx_raw_bootstrap();
}

const FRAME_WORDS: usize = 22;
const SLOT_X19: usize = 8;
const SLOT_X20: usize = 9;
const SLOT_X30: usize = 19;

pub unsafe fn prepare(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> *mut u8 {
    let top = (top as usize) & !15;
    let sp = (top - FRAME_WORDS * 8) as *mut usize;
    for i in 0..FRAME_WORDS {
        sp.add(i).write(0);
    }
    sp.add(SLOT_X19).write(arg as usize);
    sp.add(SLOT_X20).write(entry as usize);
    sp.add(SLOT_X30).write(scx_ctx_raw_bootstrap as usize);
    sp.cast()
}

#[inline(always)]
pub unsafe fn swap(save: *mut *mut u8, restore: *mut u8) {
    scx_ctx_raw_swap(save, restore)
}
