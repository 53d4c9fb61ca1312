use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{Receiver, Sender};
#[cfg(target_os = "linux")]
use libc::{c_void, pthread_self, siginfo_t};
use rand::Rng;
use tracing::{instrument, Span};
#[cfg(target_os = "linux")]
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use crate::func::exports::get_os_page_size;
use crate::hypervisor::handlers::{MemAccessHandlerWrapper, OutBHandlerWrapper};
#[cfg(target_os = "windows")]
use crate::hypervisor::hyperv_windows::HypervWindowsDriver;
use crate::hypervisor::{terminate_execution, Hypervisor};
use crate::mem::ptr::RawPtr;
use crate::sandbox::hypervisor::HypervisorWrapper;
use crate::sandbox::WrapperGetter;
use crate::{log_then_return, new_error, Result, SandboxError};

/// Trait to indicate that a type contains to/from receivers/transmitters for
/// `VCPUAction`s and `HandlerMsg`s.
pub trait HasCommunicationChannels {
    /// Get the transmitter for vCPU actions to the handler
    fn get_to_handler_tx(&self) -> Sender<VCPUAction>;
    /// Set the transmitter to send messages to the handler
    fn set_to_handler_tx(&mut self, tx: Sender<VCPUAction>);
    /// Drop the transmitter to send messages to the handler. Used to
    /// forcefully terminate the handler thread.
    fn drop_to_handler_tx(&mut self);

    /// Get the receiver for messages from the handler
    fn get_from_handler_rx(&self) -> Receiver<HandlerMsg>;
    /// Set the receiver to receive messages from the handler
    fn set_from_handler_rx(&mut self, rx: Receiver<HandlerMsg>);

    /// Get the transmitter for messages from the handler
    fn get_from_handler_tx(&self) -> Sender<HandlerMsg>;
    /// Set the transmitter for messages from the handler
    fn set_from_handler_tx(&mut self, tx: Sender<HandlerMsg>);

    /// Get the receiver for vCPU actions from the handler
    fn get_to_handler_rx(&self) -> Receiver<VCPUAction>;
    /// Set the receiver for vCPU actions from the handler
    fn set_to_handler_rx(&mut self, rx: Receiver<VCPUAction>);
}

/// The actions a Hypervisor Handler thread can execute.
pub enum VCPUAction {
    /// Initialise the vCPU
    Initialise(InitArgs),
    /// Execute the vCPU until a HLT instruction
    DispatchCallFromHost(DispatchArgs),
}

impl std::fmt::Debug for VCPUAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VCPUAction::Initialise(_) => write!(f, "Initialise"),
            VCPUAction::DispatchCallFromHost(_) => write!(f, "DispatchCallFromHost"),
        }
    }
}

/// Indicates that the Hypervisor Handler has finished performing a
/// `VCPUAction`, successfully or not.
pub enum HandlerMsg {
    /// The action completed successfully.
    FinishedVCPUAction,
    /// The action failed with the given error.
    Error(SandboxError),
}

/// Arguments to initialise the vCPU
pub struct InitArgs {
    peb_addr: RawPtr,
    seed: u64,
    page_size: u32,
    outb_handle_fn: OutBHandlerWrapper,
    mem_access_fn: MemAccessHandlerWrapper,
}

impl InitArgs {
    /// Create a new `InitArgs` instance
    pub fn new(
        peb_addr: RawPtr,
        seed: u64,
        page_size: u32,
        outb_handle_fn: OutBHandlerWrapper,
        mem_access_fn: MemAccessHandlerWrapper,
    ) -> Self {
        Self {
            peb_addr,
            seed,
            page_size,
            outb_handle_fn,
            mem_access_fn,
        }
    }
}

/// Arguments to execute the vCPU
pub struct DispatchArgs {
    function_name: String,
    dispatch_func_addr: RawPtr,
    outb_handle_fn: OutBHandlerWrapper,
    mem_access_fn: MemAccessHandlerWrapper,
}

impl DispatchArgs {
    /// Create a new `DispatchArgs` instance
    pub fn new(
        function_name: String,
        dispatch_func_addr: RawPtr,
        outb_handle_fn: OutBHandlerWrapper,
        mem_access_fn: MemAccessHandlerWrapper,
    ) -> Self {
        Self {
            function_name,
            dispatch_func_addr,
            outb_handle_fn,
            mem_access_fn,
        }
    }
}

/// Spawn a Hypervisor Handler thread that listens for `VCPUAction`s and
/// executes them against `hv`.
///
/// The execution of an action within the handler has to be paired with a
/// call to `from_handler_rx.recv()` to synchronise on completion, or the
/// caller will proceed before the required action has finished.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn start_hypervisor_handler(hv: Arc<Mutex<Box<dyn Hypervisor>>>) -> Result<()> {
    let hv_clone = hv.clone();
    hv.lock()
        .map_err(|e| new_error!("locking hypervisor: {}", e))?
        .setup_hypervisor_handler_communication_channels();

    let from_handler_tx = {
        let hv_lock = hv.lock().unwrap();
        hv_lock.get_from_handler_tx()
    };

    let to_handler_rx = {
        let hv_lock = hv.lock().unwrap();
        hv_lock.get_to_handler_rx()
    };

    // The handler thread also handles cancellation. When the host needs to
    // cancel execution, there are two cases depending on whether the vCPU is
    // currently running:
    //
    // 1. If the vCPU is executing, we have to interrupt the underlying
    //    hypervisor call.
    // 2. If the vCPU is not executing (i.e. hasn't started the next action
    //    yet), we set a flag that is checked before the next action begins.
    //
    // On Linux, case 1 is handled by sending a realtime signal to the thread
    // running the vCPU, causing an EINTR on the blocking ioctl. There is a
    // race between checking the cancellation flag and entering the blocking
    // call, so the signal is sent repeatedly until the vCPU thread
    // acknowledges cancellation via `run_cancelled`.
    {
        let mut hv_lock = hv.lock().unwrap();
        hv_lock.set_termination_status(false);
        #[cfg(target_os = "linux")]
        hv_lock.set_run_cancelled(false);
    }

    #[cfg(target_os = "windows")]
    {
        use crate::hypervisor::PARTITION_HANDLE;
        PARTITION_HANDLE.with(|cell| -> Result<()> {
            let hv_lock = hv.lock().unwrap();
            let driver: &HypervWindowsDriver = match hv_lock.as_any().downcast_ref() {
                Some(b) => b,
                None => log_then_return!(new_error!("expected a HypervWindowsDriver")),
            };
            *cell.lock().unwrap() = Some(driver.get_partition_hdl());
            Ok(())
        })?;
    }

    let join_handle = {
        thread::spawn(move || -> Result<()> {
            for action in to_handler_rx.clone() {
                match action {
                    VCPUAction::Initialise(args) => {
                        let mut hv_lock = hv_clone.lock().unwrap();
                        hv_lock.set_termination_status(false);
                        #[cfg(target_os = "linux")]
                        hv_lock.set_run_cancelled(false);

                        #[cfg(target_os = "linux")]
                        {
                            let thread_id = unsafe { pthread_self() };
                            hv_lock.set_thread_id(thread_id as u64);

                            extern "C" fn handle_signal(_: i32, _: *mut siginfo_t, _: *mut c_void) {}
                            if let Err(e) = register_signal_handler(SIGRTMIN(), handle_signal) {
                                panic!("failed to register signal handler: {:?}", e);
                            }
                        }

                        let res = hv_lock.initialise(
                            args.peb_addr,
                            args.seed,
                            args.page_size,
                            args.outb_handle_fn,
                            args.mem_access_fn,
                        );
                        send_handler_result(&from_handler_tx, res)?;
                    }
                    VCPUAction::DispatchCallFromHost(args) => {
                        let mut hv_lock = hv_clone.lock().unwrap();
                        hv_lock.set_termination_status(false);
                        #[cfg(target_os = "linux")]
                        hv_lock.set_run_cancelled(false);

                        log::info!("dispatching call from host: {}", args.function_name);
                        let res = hv_lock.dispatch_call_from_host(
                            args.dispatch_func_addr,
                            args.outb_handle_fn,
                            args.mem_access_fn,
                        );
                        send_handler_result(&from_handler_tx, res)?;
                    }
                }
            }
            Ok(())
        })
    };

    {
        let mut hv_lock = hv.lock().unwrap();
        hv_lock.set_handler_join_handle(join_handle);
    }

    Ok(())
}

fn send_handler_result(tx: &Sender<HandlerMsg>, res: Result<()>) -> Result<()> {
    let msg = match res {
        Ok(()) => HandlerMsg::FinishedVCPUAction,
        Err(e) => HandlerMsg::Error(e),
    };
    tx.send(msg)
        .map_err(|_| new_error!("hypervisor handler communication channel closed"))
}

/// Try to `join` the Hypervisor Handler thread for `max_execution_time`.
/// Takes ownership of the join handle.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn try_join_hypervisor_handler_thread<'a, T>(sbox: &mut T) -> Result<()>
where
    T: WrapperGetter<'a>,
{
    let hv_wrapper = sbox.get_hv_mut();
    if let Some(handle) = hv_wrapper
        .try_get_hypervisor_lock()?
        .get_mut_handler_join_handle()
        .take()
    {
        let now = std::time::Instant::now();
        let timeout = hv_wrapper.max_execution_time;
        while now.elapsed() < timeout {
            if handle.is_finished() {
                return match handle.join() {
                    Ok(res) => res,
                    Err(e) => Err(new_error!("hypervisor handler thread panicked: {:?}", e)),
                };
            }
            sleep(Duration::from_millis(1));
        }
    }

    Err(new_error!("failed to finish hypervisor handler thread"))
}

/// Kill the Hypervisor Handler thread by dropping its incoming channel,
/// then join it.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn kill_hypervisor_handler_thread<'a, T>(sbox: &mut T) -> Result<()>
where
    T: WrapperGetter<'a>,
{
    {
        let mut hv_lock = sbox.get_hv_mut().try_get_hypervisor_lock()?;
        hv_lock.drop_to_handler_tx();
    }
    try_join_hypervisor_handler_thread(sbox)
}

/// Terminate the execution of the hypervisor handler after a guest function
/// call has timed out, restore the sandbox's memory snapshot, and
/// re-initialise the vCPU.
///
/// It's possible that the guest function finishes right as the host decides
/// to cancel it; in that case, this call is a no-op and returns
/// `SandboxError::ExecutionCanceledByHost` being misleadingly reported is
/// avoided by returning `Ok` so the caller can fetch the completed result.
#[allow(clippy::too_many_arguments)]
pub(crate) fn terminate_hypervisor_handler_execution_and_reinitialise<'a, HvMemMgrT: WrapperGetter<'a>>(
    wrapper_getter: &mut HvMemMgrT,
    max_execution_time: Duration,
    termination_status: Arc<AtomicCell<bool>>,
    outb_hdl: OutBHandlerWrapper,
    mem_access_hdl: MemAccessHandlerWrapper,
    #[cfg(target_os = "linux")] thread_id: u64,
    #[cfg(target_os = "linux")] run_cancelled: Arc<AtomicCell<bool>>,
    #[cfg(target_os = "linux")] max_wait_for_cancellation: Duration,
) -> Result<()> {
    let seed = rand::thread_rng().gen::<u64>();

    let peb_addr = {
        let mem_mgr = wrapper_getter.get_mgr_mut().as_mut();
        RawPtr::from(u64::try_from(mem_mgr.layout.peb_address)?)
    };
    let page_size = u32::try_from(get_os_page_size())?;

    terminate_execution(
        max_execution_time,
        termination_status,
        #[cfg(target_os = "linux")]
        run_cancelled,
        #[cfg(target_os = "linux")]
        thread_id,
        #[cfg(target_os = "linux")]
        max_wait_for_cancellation,
    )?;

    {
        let mem_mgr = wrapper_getter.get_mgr_mut().as_mut();
        mem_mgr.restore_state()?;
    }

    // Re-initialise the vCPU: without this, any timed-out call leaves it in
    // a state where all it takes to DoS the sandbox is one more call.
    execute_vcpu_action(
        wrapper_getter.get_hv(),
        VCPUAction::Initialise(InitArgs::new(peb_addr, seed, page_size, outb_hdl, mem_access_hdl)),
        None,
    )
}

/// Send a `VCPUAction` to the Hypervisor Handler and wait for its response.
///
/// If no `max_wait_time` is given, `SandboxConfiguration::DEFAULT_MAX_EXECUTION_TIME`
/// is used.
pub(crate) fn execute_vcpu_action(
    hv_wrapper: &HypervisorWrapper,
    vcpu_action: VCPUAction,
    max_wait_time: Option<Duration>,
) -> Result<()> {
    use crate::sandbox::SandboxConfiguration;

    let (to_handler_tx, from_handler_rx) = {
        let hv_lock = hv_wrapper.try_get_hypervisor_lock()?;
        (hv_lock.get_to_handler_tx(), hv_lock.get_from_handler_rx())
    };

    to_handler_tx
        .send(vcpu_action)
        .map_err(|_| new_error!("hypervisor handler communication channel closed"))?;

    let wait = max_wait_time
        .unwrap_or_else(|| Duration::from_millis(SandboxConfiguration::DEFAULT_MAX_EXECUTION_TIME_MS as u64));
    try_receive_handler_msg(from_handler_rx, wait)
}

/// Receive a `HandlerMsg` from the Hypervisor Handler thread, waiting up to
/// `wait`.
pub(crate) fn try_receive_handler_msg(from_handler_rx: Receiver<HandlerMsg>, wait: Duration) -> Result<()> {
    match from_handler_rx.recv_timeout(wait) {
        Ok(HandlerMsg::Error(e)) => Err(e),
        Ok(HandlerMsg::FinishedVCPUAction) => Ok(()),
        Err(_) => Err(new_error!("timed out waiting for hypervisor handler response")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam::atomic::AtomicCell;

    use crate::hypervisor::hypervisor_handler::terminate_hypervisor_handler_execution_and_reinitialise;
    use crate::sandbox::{SandboxConfiguration, SandboxRunOptions, WrapperGetter};
    use crate::testing::simple_guest_buf;
    use crate::{is_hypervisor_present, GuestBinary, Result, UninitializedSandbox};

    fn create_multi_use_sandbox() -> crate::sandbox::MultiUseSandbox {
        if !is_hypervisor_present() {
            panic!("no hypervisor is present");
        }
        let usbox = UninitializedSandbox::new(
            GuestBinary::File(simple_guest_buf()),
            SandboxConfiguration::default(),
            SandboxRunOptions::RecycleAfterRun,
        )
        .unwrap();
        usbox.initialize(|_| Ok(())).unwrap()
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn terminate_execution_then_call_another_function() -> Result<()> {
        let mut sandbox = create_multi_use_sandbox();

        let res: Result<()> = sandbox.call_guest_function("Spin", vec![]);
        assert!(res.is_err());

        let res: Result<i32> = sandbox.call_guest_function("Echo", vec!["a".to_string().into()]);
        assert!(res.is_ok());
        Ok(())
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn terminate_execution_of_an_already_finished_function() -> Result<()> {
        let mut sandbox = create_multi_use_sandbox();
        let _: i32 = sandbox
            .call_guest_function("PrintOutput", vec!["Hello, World!\n".to_string().into()])
            .unwrap();

        let (outb_hdl, mem_access_hdl) = {
            let hv_wrapper = sandbox.get_hv_mut();
            (hv_wrapper.outb_hdl.clone(), hv_wrapper.mem_access_hdl.clone())
        };
        #[cfg(target_os = "linux")]
        let thread_id = {
            let hv_lock = sandbox.get_hv_mut().try_get_hypervisor_lock()?;
            hv_lock.get_thread_id()
        };

        let _ = terminate_hypervisor_handler_execution_and_reinitialise(
            &mut sandbox,
            Duration::from_millis(SandboxConfiguration::DEFAULT_MAX_EXECUTION_TIME_MS as u64),
            Arc::new(AtomicCell::new(true)),
            outb_hdl,
            mem_access_hdl,
            #[cfg(target_os = "linux")]
            thread_id,
            #[cfg(target_os = "linux")]
            Arc::new(AtomicCell::new(false)),
            #[cfg(target_os = "linux")]
            Duration::from_millis(100),
        );

        let _: i32 = sandbox
            .call_guest_function("PrintOutput", vec!["Hello, World!\n".to_string().into()])
            .unwrap();
        Ok(())
    }
}
