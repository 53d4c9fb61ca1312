use crate::mem::mgr::{SandboxMemoryManager, STACK_COOKIE_LEN};
use crate::Result;
use tracing::instrument;

/// The random cookie seeded below the guest's stack to detect guest
/// stack overflows.
pub(crate) type StackCookie = [u8; STACK_COOKIE_LEN];

/// A `SandboxMemoryManager` plus the stack guard cookie generated for it.
///
/// Every sandbox type (`UninitializedSandbox`, `MultiUseSandbox`) owns
/// one of these, and accesses its memory exclusively through it.
#[derive(Clone)]
pub(crate) struct MemMgrWrapper {
    mgr: SandboxMemoryManager,
    stack_guard: StackCookie,
}

impl MemMgrWrapper {
    pub(crate) fn new(mgr: SandboxMemoryManager, stack_guard: StackCookie) -> Self {
        Self { mgr, stack_guard }
    }

    /// Write the stack guard into guest memory and take the first memory
    /// snapshot, so `restore_state` has something to restore from
    /// before the first guest call ever runs.
    #[instrument(err(Debug), skip(self))]
    pub(crate) fn write_memory_layout(&mut self) -> Result<()> {
        self.mgr.set_stack_guard(&self.stack_guard)?;
        self.mgr.snapshot_state()
    }

    pub(crate) fn as_ref(&self) -> &SandboxMemoryManager {
        &self.mgr
    }

    pub(crate) fn as_mut(&mut self) -> &mut SandboxMemoryManager {
        &mut self.mgr
    }

    pub(crate) fn get_stack_cookie(&self) -> &StackCookie {
        &self.stack_guard
    }
}

pub(crate) trait MemMgr {
    /// Get an immutable reference to the internally-stored
    /// `SandboxMemoryManager`
    fn get_mem_mgr(&self) -> &SandboxMemoryManager;

    /// Get the internally-stored stack cookie that was written
    /// as a stack guard to guest memory.
    fn get_stack_cookie(&self) -> &StackCookie;

    /// Check the stack guard against the stack guard cookie stored
    /// within `self`. Return `Ok(true)` if the guard cookie could
    /// be found and it matched `self.stack_guard`, `Ok(false)` if
    /// if could be found and did not match `self.stack_guard`, and
    /// `Err` if it could not be found or there was some other error.
    #[instrument(err(Debug), skip(self))]
    fn check_stack_guard(&self) -> Result<bool> {
        self.get_mem_mgr().check_stack_guard(*self.get_stack_cookie())
    }
}
