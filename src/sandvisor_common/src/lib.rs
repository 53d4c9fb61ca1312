//! Types shared between the sandvisor host process and the guest binaries
//! that run inside its micro-sandboxes.
//!
//! This crate is `no_std` so that it can, in principle, be linked into a
//! guest binary as well as the host. Only the pieces of the wire contract
//! that both sides must agree on byte-for-byte live here: the shared
//! memory layout of the process environment block (PEB) and a handful of
//! size constants.
#![no_std]

/// Layout of the guest-visible process environment block and its
/// constituent buffers.
pub mod mem;
