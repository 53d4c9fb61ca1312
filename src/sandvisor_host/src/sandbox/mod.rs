/// Configuration needed to establish a sandbox.
pub mod config;
/// Functionality for registering and calling host functions.
mod host_funcs;
/// Functionality for dealing with sandboxes that own a hypervisor.
pub(crate) mod hypervisor;
/// Functionality for dealing with initialized sandboxes that can call
/// any number of guest functions.
pub mod initialized_multi_use;
/// The handler invoked when the guest vCPU traps on an access outside
/// its mapped memory regions.
mod mem_access;
/// Functionality for interacting with a sandbox's internally-stored
/// `SandboxMemoryManager`.
pub(crate) mod mem_mgr;
/// The handler invoked on every `outb` exit: guest logging, guest-to-host
/// function calls, and guest aborts.
mod outb;
/// Options for configuring how a sandbox's vCPU thread is run.
mod run_options;
/// Functionality for creating uninitialized sandboxes, manipulating them,
/// registering host functions against them, and converting them to
/// initialized sandboxes via `UninitializedSandbox::initialize`.
pub mod uninitialized;

/// Re-export for `SandboxConfiguration` type
pub use config::SandboxConfiguration;
/// Re-export for the `MultiUseSandbox` type
pub use initialized_multi_use::MultiUseSandbox;
/// Re-export for `SandboxRunOptions` type
pub use run_options::SandboxRunOptions;
use tracing::instrument;
use tracing::Span;
/// Re-export for `GuestBinary` type
pub use uninitialized::GuestBinary;
/// Re-export for `UninitializedSandbox` type
pub use uninitialized::UninitializedSandbox;

use self::mem_mgr::MemMgrWrapper;
use super::sandbox::hypervisor::HypervisorWrapper;
use crate::func::SandboxHostFunction;
#[cfg(target_os = "windows")]
use crate::hypervisor::windows_hypervisor_platform;
#[cfg(target_os = "linux")]
use crate::hypervisor::{hyperv_linux, kvm};
use std::collections::HashMap;

/// Determine if this is a supported platform for running sandboxes.
#[instrument(skip_all, parent = Span::current())]
pub fn is_supported_platform() -> bool {
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    return false;
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    true
}

/// A `HashMap` mapping function names to the `SandboxHostFunction`s they
/// were registered under.
#[derive(Clone, Default)]
pub(super) struct FunctionsMap<'a>(HashMap<String, SandboxHostFunction<'a>>);

impl<'a> FunctionsMap<'a> {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub(super) fn insert(&mut self, key: String, value: SandboxHostFunction<'a>) {
        self.0.insert(key, value);
    }

    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub(super) fn get(&self, key: &str) -> Option<&SandboxHostFunction<'a>> {
        self.0.get(key)
    }

    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'a> PartialEq for FunctionsMap<'a> {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.0.keys().all(|k| other.0.contains_key(k))
    }
}

impl<'a> Eq for FunctionsMap<'a> {}

/// Determine whether a hypervisor capable of running a sandbox is
/// present on this host.
#[instrument(skip_all, parent = Span::current())]
pub fn is_hypervisor_present() -> bool {
    #[cfg(target_os = "linux")]
    {
        hyperv_linux::is_hypervisor_present(false).unwrap_or(false) || kvm::is_present().is_ok()
    }
    #[cfg(target_os = "windows")]
    {
        windows_hypervisor_platform::is_hypervisor_present().unwrap_or(false)
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    false
}

/// Shared accessors for types that own both a `MemMgrWrapper` and a
/// `HypervisorWrapper<'a>` — `UninitializedSandbox` and `MultiUseSandbox`.
pub(crate) trait WrapperGetter<'a> {
    fn get_mgr(&self) -> &MemMgrWrapper;
    fn get_mgr_mut(&mut self) -> &mut MemMgrWrapper;
    fn get_hv(&self) -> &HypervisorWrapper<'a>;
    fn get_hv_mut(&mut self) -> &mut HypervisorWrapper<'a>;
}
