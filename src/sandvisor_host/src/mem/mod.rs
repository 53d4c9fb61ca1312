//! Functionality to establish and manage an individual sandbox's memory.
//!
//! The start of a sandbox's guest memory contains the page tables and is
//! always located at virtual address `0x200000` when running in a
//! hypervisor partition:
//!
//! ```text
//! 0x200000    PML4
//! 0x201000    PDPT
//! 0x202000    PD
//! 0x203000    the guest PE code
//! ```
//!
//! The pointer passed to the guest entrypoint is `0x200000 + size of
//! page tables + size of code`; at that address, `SandboxMemoryLayout`
//! lays out the PEB, host function definitions, host exception data,
//! guest error data, the input/output data buffers, the guest heap, and
//! the guest stack, in that order.

/// The layout of a sandbox's guest memory: offsets and sizes of every
/// region described above.
pub mod layout;
/// Owns `SharedMemory` and `SandboxMemoryLayout` and performs every
/// read or write a sandbox needs to make against guest memory.
pub mod mgr;
/// The memory region descriptors handed to a hypervisor backend to map
/// guest memory into a partition.
pub mod memory_region;
/// PE parsing, relocation, and header inspection for guest binaries.
pub mod pe;
/// Typed pointers into a sandbox's address spaces.
pub mod ptr;
/// The guest and host address spaces `ptr` converts between.
pub mod ptr_addr_space;
/// A byte offset into a sandbox's guest memory.
pub mod ptr_offset;
/// An mmap-backed region of memory shared between host and guest.
pub mod shared_mem;
/// A point-in-time copy of `SharedMemory`, used to restore a sandbox's
/// state between calls.
pub mod shared_mem_snapshot;
