//! Global hypervisor heap, backed by the coalescing [`Allocator`].

use super::allocator::Allocator;

const HEAP_START: u64 = 0x4100_0000;
const HEAP_SIZE: u64 = 0x100_0000; // 16MB

#[cfg_attr(not(test), global_allocator)]
static HEAP: Allocator = Allocator::new();

/// Initialize the global heap. Must be called before any allocation that
/// goes through `alloc::boxed::Box`/`Vec`/etc, i.e. before `mm::memdb` or
/// `mm::pgtable` levels are first allocated.
pub fn init() {
    HEAP.add_memory(HEAP_START, HEAP_SIZE)
        .expect("heap: initial span rejected");
}

/// Allocate a 4KB-aligned page from the global heap.
pub fn alloc_page() -> Option<u64> {
    HEAP.allocate(4096, 4096).ok()
}

/// Free a 4KB page previously returned by [`alloc_page`].
pub fn free_page(addr: u64) {
    let _ = HEAP.deallocate(addr, 4096);
}

/// Allocate memory with specified size and alignment.
pub fn alloc_aligned(size: u64, align: u64) -> Option<u64> {
    HEAP.allocate(size, align).ok()
}

/// Allocate memory with default alignment (8 bytes).
pub fn alloc(size: u64) -> Option<u64> {
    HEAP.allocate(size, 8).ok()
}

/// Get remaining heap space.
pub fn remaining() -> u64 {
    HEAP.free_size()
}

/// Get total allocated bytes.
pub fn allocated() -> u64 {
    HEAP.alloc_size()
}
