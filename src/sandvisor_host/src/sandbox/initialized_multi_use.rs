use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::atomic::AtomicCell;
use tracing::{instrument, Span};

use super::host_funcs::HostFuncsWrapper;
use super::hypervisor::HypervisorWrapper;
use super::mem_mgr::MemMgrWrapper;
use super::run_options::SandboxRunOptions;
use super::WrapperGetter;
use crate::func::function_call::FunctionCall;
use crate::func::types::{ParameterValue, ReturnValue};
use crate::hypervisor::hypervisor_handler::{
    execute_vcpu_action, terminate_hypervisor_handler_execution_and_reinitialise, DispatchArgs, VCPUAction,
};
use crate::mem::ptr::RawPtr;
use crate::sandbox_state::sandbox::Sandbox;
use crate::{Result, SandboxError};

/// A sandbox whose vCPU has been initialised and can service guest function
/// calls.
///
/// If created with `SandboxRunOptions::RecycleAfterRun`, memory is restored
/// to its post-initialisation snapshot after every call, and any number of
/// calls can be made. Otherwise, the first call consumes the sandbox: a
/// second attempt fails with `SandboxError::NotRecyclable`.
pub struct MultiUseSandbox {
    /// Kept alive so the closures captured by `hv.outb_hdl` (which hold
    /// their own clone of this `Arc`) keep a live registry to call into;
    /// never read directly.
    _host_funcs: Arc<Mutex<HostFuncsWrapper<'static>>>,
    mgr: MemMgrWrapper,
    hv: HypervisorWrapper<'static>,
    run_options: SandboxRunOptions,
    dispatch_function_addr: RawPtr,
    call_in_progress: AtomicBool,
    has_completed_a_call: AtomicBool,
}

impl std::fmt::Debug for MultiUseSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiUseSandbox")
            .field("run_options", &self.run_options)
            .field("has_completed_a_call", &self.has_completed_a_call.load(Ordering::SeqCst))
            .finish()
    }
}

impl Sandbox for MultiUseSandbox {
    fn is_reusable(&self) -> bool {
        self.run_options.is_recyclable()
    }
}

impl WrapperGetter<'static> for MultiUseSandbox {
    fn get_mgr(&self) -> &MemMgrWrapper {
        &self.mgr
    }
    fn get_mgr_mut(&mut self) -> &mut MemMgrWrapper {
        &mut self.mgr
    }
    fn get_hv(&self) -> &HypervisorWrapper<'static> {
        &self.hv
    }
    fn get_hv_mut(&mut self) -> &mut HypervisorWrapper<'static> {
        &mut self.hv
    }
}

impl MultiUseSandbox {
    /// Build a `MultiUseSandbox` out of an `UninitializedSandbox`'s parts,
    /// once its vCPU has been initialised and `dispatch_function_addr` has
    /// been read out of guest memory.
    ///
    /// Takes a snapshot of memory in its initialised state, so a recyclable
    /// sandbox can be restored to it after every call.
    pub(crate) fn new(
        host_funcs: Arc<Mutex<HostFuncsWrapper<'static>>>,
        mut mgr: MemMgrWrapper,
        hv: HypervisorWrapper<'static>,
        run_options: SandboxRunOptions,
        dispatch_function_addr: RawPtr,
    ) -> Result<Self> {
        mgr.as_mut().snapshot_state()?;
        Ok(Self {
            _host_funcs: host_funcs,
            mgr,
            hv,
            run_options,
            dispatch_function_addr,
            call_in_progress: AtomicBool::new(false),
            has_completed_a_call: AtomicBool::new(false),
        })
    }

    /// Call the guest function named `function_name` with `args`, blocking
    /// until it returns, halts on an error, or `max_execution_time` elapses.
    ///
    /// A sandbox created with `SandboxRunOptions::RecycleAfterRun` restores
    /// its memory to the post-initialisation snapshot after the call, so it
    /// can be called again; otherwise, this consumes the sandbox's single
    /// use.
    #[instrument(err(Debug), skip(self, args), parent = Span::current())]
    pub fn call_guest_function<R>(&mut self, function_name: &str, args: Vec<ParameterValue>) -> Result<R>
    where
        R: TryFrom<ReturnValue, Error = SandboxError>,
    {
        if !self.run_options.is_recyclable() && self.has_completed_a_call.load(Ordering::SeqCst) {
            return Err(SandboxError::NotRecyclable);
        }
        if self
            .call_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SandboxError::AlreadyInProgress);
        }

        let result = self.dispatch_call(function_name, args);
        self.call_in_progress.store(false, Ordering::SeqCst);

        if result.is_ok() {
            self.has_completed_a_call.store(true, Ordering::SeqCst);
            if self.run_options.is_recyclable() {
                self.mgr.as_mut().restore_state()?;
            }
        }

        result.and_then(R::try_from)
    }

    fn dispatch_call(&mut self, function_name: &str, args: Vec<ParameterValue>) -> Result<ReturnValue> {
        let call = FunctionCall::new(function_name.to_string(), args);
        let buffer = Vec::<u8>::try_from(&call)?;
        self.mgr.as_mut().write_guest_function_call(&buffer)?;

        let (outb_hdl, mem_access_hdl) = (self.hv.outb_hdl.clone(), self.hv.mem_access_hdl.clone());
        let max_execution_time = self.hv.max_execution_time;
        let dispatch_args = DispatchArgs::new(
            function_name.to_string(),
            self.dispatch_function_addr.clone(),
            outb_hdl.clone(),
            mem_access_hdl.clone(),
        );

        if let Err(e) = execute_vcpu_action(
            &self.hv,
            VCPUAction::DispatchCallFromHost(dispatch_args),
            Some(max_execution_time),
        ) {
            let _ = self.recover_from_failed_call(max_execution_time, outb_hdl, mem_access_hdl);
            return Err(e);
        }

        self.mgr.as_ref().get_function_call_result()
    }

    /// A call that errored (most commonly: timed out and was cancelled by
    /// the handler thread's watchdog) leaves the vCPU in whatever state it
    /// was interrupted in. Restore memory to the last snapshot and
    /// re-initialise the vCPU so the sandbox is usable for the next call.
    fn recover_from_failed_call(
        &mut self,
        max_execution_time: std::time::Duration,
        outb_hdl: crate::hypervisor::handlers::OutBHandlerWrapper<'static>,
        mem_access_hdl: crate::hypervisor::handlers::MemAccessHandlerWrapper<'static>,
    ) -> Result<()> {
        #[cfg(target_os = "linux")]
        let thread_id = self.hv.try_get_hypervisor_lock()?.get_thread_id();
        #[cfg(target_os = "linux")]
        let max_wait_for_cancellation = self.hv.max_wait_for_cancellation;

        terminate_hypervisor_handler_execution_and_reinitialise(
            self,
            max_execution_time,
            Arc::new(AtomicCell::new(true)),
            outb_hdl,
            mem_access_hdl,
            #[cfg(target_os = "linux")]
            thread_id,
            #[cfg(target_os = "linux")]
            Arc::new(AtomicCell::new(false)),
            #[cfg(target_os = "linux")]
            max_wait_for_cancellation,
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::sandbox::{SandboxConfiguration, SandboxRunOptions};
    use crate::testing::simple_guest_buf;
    use crate::{is_hypervisor_present, GuestBinary, UninitializedSandbox};

    fn new_sandbox(run_options: SandboxRunOptions) -> super::MultiUseSandbox {
        if !is_hypervisor_present() {
            panic!("no hypervisor is present");
        }
        let usbox = UninitializedSandbox::new(
            GuestBinary::File(simple_guest_buf()),
            SandboxConfiguration::default(),
            run_options,
        )
        .unwrap();
        usbox.initialize(|_| Ok(())).unwrap()
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn recyclable_sandbox_can_be_called_repeatedly() {
        let mut sandbox = new_sandbox(SandboxRunOptions::RecycleAfterRun);
        let echoed: String = sandbox
            .call_guest_function("Echo", vec!["a".to_string().into()])
            .unwrap();
        assert_eq!(echoed, "a");
        let echoed: String = sandbox
            .call_guest_function("Echo", vec!["b".to_string().into()])
            .unwrap();
        assert_eq!(echoed, "b");
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn non_recyclable_sandbox_rejects_a_second_call() {
        let mut sandbox = new_sandbox(SandboxRunOptions::None);
        let _: String = sandbox
            .call_guest_function("Echo", vec!["a".to_string().into()])
            .unwrap();
        let res: Result<String, _> = sandbox.call_guest_function("Echo", vec!["b".to_string().into()]);
        assert!(matches!(res, Err(crate::SandboxError::NotRecyclable)));
    }
}
