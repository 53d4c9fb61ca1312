use std::sync::{Arc, Mutex};

use super::mem_mgr::MemMgrWrapper;
use crate::hypervisor::handlers::{MemAccessHandler, MemAccessHandlerFunction, MemAccessHandlerWrapper};
use crate::SandboxError;

/// Build a `MemAccessHandlerWrapper` that fails the call whenever the
/// guest vCPU traps on a memory access outside its mapped regions.
///
/// `mem_mgr_wrapper` is accepted, not inspected, to mirror
/// `outb::outb_handler_wrapper`'s shape and leave room for a future
/// handler that consults guest memory before failing.
pub(super) fn mem_access_handler_wrapper(_mem_mgr_wrapper: MemMgrWrapper) -> MemAccessHandlerWrapper<'static> {
    let func: MemAccessHandlerFunction<'static> =
        Box::new(|| Err(SandboxError::Error("guest accessed memory outside its mapped regions".to_string())));
    Arc::new(Mutex::new(MemAccessHandler::from(func)))
}
