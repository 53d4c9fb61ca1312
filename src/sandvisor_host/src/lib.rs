//! Creates short-lived, hardware-virtualized micro-sandboxes for running
//! untrusted native PE binaries with a minimal host/guest RPC surface.
#![deny(dead_code, missing_docs, unused_mut)]

/// Errors that can occur while creating, running, or tearing down a
/// sandbox.
pub mod error;
/// Host and guest function types, the wire format used to exchange them
/// with a running sandbox, and the `HostFunctionN` registration traits.
pub mod func;
/// Hypervisor backends (KVM, Hyper-V) and the low-level register/memory
/// access they expose.
pub mod hypervisor;
/// Guest memory layout, shared memory allocation, and PE loading.
pub mod mem;
/// The sandbox lifecycle: uninitialized, initialized, and the
/// configuration and run options that govern them.
pub mod sandbox;
/// `trait`s describing valid transitions between sandbox states.
pub mod sandbox_state;
/// Utilities for locating and loading the test guest binaries used by
/// this crate's own test suite.
#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SandboxError};
pub use func::host::{
    HostFunction0, HostFunction1, HostFunction10, HostFunction2, HostFunction3, HostFunction4,
    HostFunction5, HostFunction6, HostFunction7, HostFunction8, HostFunction9,
};
pub use func::types::{ParameterType, ParameterValue, ReturnType, ReturnValue};
pub use sandbox::{
    is_hypervisor_present, is_supported_platform, GuestBinary, MultiUseSandbox, SandboxConfiguration,
    SandboxRunOptions, UninitializedSandbox,
};
