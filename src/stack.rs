//! Stack regions for logical threads.
//!
//! Every stack is its own anonymous mapping: `guard_pages` inaccessible
//! pages at the low end, followed by the usable region. Stacks grow down, so
//! running off the usable region faults on the guard instead of corrupting a
//! neighbour.
//!
//! The arena keeps allocation and release counters shared with every stack it
//! hands out, so leaks and double releases are observable from outside.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crate::error::ContextError;

/// Host page size, with a conservative fallback.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as usize
    } else {
        4096
    }
}

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Snapshot of arena activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    pub allocated: u64,
    pub released: u64,
}

impl ArenaStats {
    /// Stacks currently mapped.
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

/// Allocator of fixed-size, guarded stacks.
#[derive(Debug)]
pub struct StackArena {
    page_size: usize,
    stack_size: usize,
    guard_size: usize,
    register: bool,
    counters: Arc<Counters>,
}

impl StackArena {
    /// `stack_size` is rounded up to whole pages.
    pub fn new(stack_size: usize, guard_pages: usize, register: bool) -> Result<Self, ContextError> {
        let page_size = page_size();
        if stack_size == 0 {
            return Err(ContextError::config("stack size must be non-zero"));
        }
        let stack_size = stack_size
            .checked_next_multiple_of(page_size)
            .ok_or_else(|| ContextError::config("stack size overflows the address space"))?;
        let guard_size = guard_pages
            .checked_mul(page_size)
            .ok_or_else(|| ContextError::config("guard size overflows the address space"))?;
        Ok(StackArena {
            page_size,
            stack_size,
            guard_size,
            register,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Usable bytes per stack.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocated: self.counters.allocated.load(Relaxed),
            released: self.counters.released.load(Relaxed),
        }
    }

    /// Map a fresh stack.
    pub fn allocate(&self) -> Result<Stack, ContextError> {
        let len = self.guard_size + self.stack_size;
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        // SAFETY: anonymous private mapping with no address hint.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ContextError::OutOfMemory {
                size: self.stack_size,
            });
        }

        if self.guard_size > 0 {
            // SAFETY: the guard range lies at the start of the mapping above.
            let ret = unsafe { libc::mprotect(base, self.guard_size, libc::PROT_NONE) };
            if ret != 0 {
                let err = ContextError::last_os("mprotect");
                // SAFETY: same range as the mmap above.
                unsafe { libc::munmap(base, len) };
                return Err(err);
            }
        }

        let Some(base) = NonNull::new(base.cast::<u8>()) else {
            return Err(ContextError::OutOfMemory {
                size: self.stack_size,
            });
        };
        let mut stack = Stack {
            base,
            len,
            guard_size: self.guard_size,
            valgrind_id: None,
            counters: Arc::clone(&self.counters),
        };
        if self.register {
            stack.valgrind_id = Some(valgrind::stack_register(stack.bottom(), stack.top()));
        }
        self.counters.allocated.fetch_add(1, Relaxed);
        Ok(stack)
    }
}

/// One mapped stack. Unmapped on drop.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard_size: usize,
    valgrind_id: Option<usize>,
    counters: Arc<Counters>,
}

// SAFETY: a Stack is an exclusively owned memory region; the raw pointer is
// never shared through this type.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Lowest usable address, just above the guard.
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: guard_size < len, stays inside the mapping.
        unsafe { self.base.as_ptr().add(self.guard_size) }
    }

    /// One past the highest usable address. Initial stack pointers are
    /// derived from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the mapping.
        unsafe { self.base.as_ptr().add(self.len) }
    }

    pub fn usable_size(&self) -> usize {
        self.len - self.guard_size
    }

    /// Whether `addr` falls into this stack's guard region.
    pub fn guard_contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr < start + self.guard_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some(id) = self.valgrind_id.take() {
            valgrind::stack_deregister(id);
        }
        // SAFETY: base/len describe a live mapping owned by this Stack.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
        self.counters.released.fetch_add(1, Relaxed);
    }
}

/// Valgrind client requests for stack registration.
///
/// Without the `valgrind` feature, or on hosts without a known request
/// sequence, these are no-ops returning 0.
mod valgrind {
    #[cfg(feature = "valgrind")]
    const STACK_REGISTER: usize = 0x1501;
    #[cfg(feature = "valgrind")]
    const STACK_DEREGISTER: usize = 0x1502;

    #[cfg(feature = "valgrind")]
    pub(super) fn stack_register(start: *mut u8, end: *mut u8) -> usize {
        client_request(0, [STACK_REGISTER, start as usize, end as usize, 0, 0, 0])
    }

    #[cfg(feature = "valgrind")]
    pub(super) fn stack_deregister(id: usize) {
        client_request(0, [STACK_DEREGISTER, id, 0, 0, 0, 0]);
    }

    #[cfg(not(feature = "valgrind"))]
    pub(super) fn stack_register(_start: *mut u8, _end: *mut u8) -> usize {
        0
    }

    #[cfg(not(feature = "valgrind"))]
    pub(super) fn stack_deregister(_id: usize) {}

    /// Outside Valgrind the preamble is a no-op and `default` comes back.
    #[cfg(all(feature = "valgrind", target_arch = "x86_64"))]
    fn client_request(default: usize, args: [usize; 6]) -> usize {
        let result;
        // SAFETY: the rotations of rdi sum to 128 bits and leave it unchanged;
        // xchg rbx,rbx is a no-op. Valgrind reads args through rax.
        unsafe {
            std::arch::asm!(
                "rol rdi, 3",
                "rol rdi, 13",
                "rol rdi, 61",
                "rol rdi, 51",
                "xchg rbx, rbx",
                inout("rdx") default => result,
                in("rax") args.as_ptr(),
                options(nostack),
            );
        }
        result
    }

    #[cfg(all(feature = "valgrind", target_arch = "aarch64"))]
    fn client_request(default: usize, args: [usize; 6]) -> usize {
        let result;
        // SAFETY: the rotations of x12 sum to 128 bits; orr x10,x10,x10 is a
        // no-op. Valgrind reads args through x4.
        unsafe {
            std::arch::asm!(
                "ror x12, x12, #3",
                "ror x12, x12, #13",
                "ror x12, x12, #51",
                "ror x12, x12, #61",
                "orr x10, x10, x10",
                inout("x3") default => result,
                in("x4") args.as_ptr(),
                options(nostack),
            );
        }
        result
    }

    #[cfg(all(
        feature = "valgrind",
        not(any(target_arch = "x86_64", target_arch = "aarch64"))
    ))]
    fn client_request(default: usize, _args: [usize; 6]) -> usize {
        default
    }
}
