use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;

use crate::hypervisor::handlers::{MemAccessHandlerWrapper, OutBHandlerWrapper};
use crate::hypervisor::hypervisor_handler::HasCommunicationChannels;
use crate::mem::ptr::RawPtr;
use crate::{new_error, Result, SandboxError};

/// Handlers passed to a vCPU's `initialise`/`dispatch_call_from_host` entry
/// points.
pub mod handlers;

#[cfg(target_os = "linux")]
/// Functionality to manipulate KVM-based virtual machines.
pub mod kvm;
#[cfg(target_os = "linux")]
/// Functionality to manipulate Microsoft Hypervisor Platform (MSHV) virtual
/// machines on Linux.
pub mod hyperv_linux;

#[cfg(target_os = "windows")]
/// Functionality to manipulate Windows Hypervisor Platform (WHV) virtual
/// machines.
pub mod hyperv_windows;
#[cfg(target_os = "windows")]
/// Interop calls into the Windows Hypervisor Platform API.
pub mod windows_hypervisor_platform;

/// The handler thread that owns a sandbox's vCPU and the cancellation
/// watchdog protocol used to enforce `max_execution_time`.
pub mod hypervisor_handler;

/// A 128-bit value, used to set Hyper-V registers wider than 64 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct U128 {
    /// The low 64 bits.
    pub low: u64,
    /// The high 64 bits.
    pub high: u64,
}

impl From<u64> for U128 {
    fn from(val: u64) -> Self {
        Self { low: val, high: 0 }
    }
}

/// The reason a vCPU's `run` call returned control to the host.
#[derive(Debug)]
pub enum SandboxExit {
    /// The guest executed an `out` instruction on the given port, with the
    /// given payload, from the given `rip` with the given instruction
    /// length.
    IoOut(u16, Vec<u8>, u64, u64),
    /// The guest halted (a normal, successful exit).
    Halt(),
    /// The guest accessed a guest physical address outside its mapped
    /// memory regions.
    Mmio(u64),
    /// The host cancelled execution of the vCPU.
    Cancelled(),
    /// An exit reason this crate does not otherwise recognize, together
    /// with a human-readable description of the vCPU's state.
    Unknown(String),
}

/// A backend capable of running a single vCPU inside a hardware-virtualized
/// partition on behalf of a sandbox.
///
/// Every operation on a `Hypervisor` is expected to run on the dedicated
/// Hypervisor Handler thread `hypervisor_handler::start_hypervisor_handler`
/// spawns, never directly on the embedder's thread.
pub trait Hypervisor: HasCommunicationChannels + Debug + Sync + Send {
    /// Set up the guest's initial register state and run it until it halts
    /// after calling its entrypoint with `peb_addr`, `seed`, and
    /// `page_size`.
    fn initialise(
        &mut self,
        peb_addr: RawPtr,
        seed: u64,
        page_size: u32,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()>;

    /// Point the vCPU's instruction pointer at `dispatch_func_addr` and run
    /// it until it halts.
    fn dispatch_call_from_host(
        &mut self,
        dispatch_func_addr: RawPtr,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()>;

    /// Handle an `IoOut` exit: invoke `outb_handle_fn` with the exit's port
    /// and payload, then advance `rip` past the faulting instruction.
    fn handle_io(
        &mut self,
        port: u16,
        data: Vec<u8>,
        rip: u64,
        instruction_length: u64,
        outb_handle_fn: OutBHandlerWrapper,
    ) -> Result<()>;

    /// Resume the vCPU until its next exit.
    fn run(&mut self) -> Result<SandboxExit>;

    /// Obtain `self` as `&dyn Any`, so that a `Box<dyn Hypervisor>` can be
    /// downcast to a concrete backend (used on Windows to recover the
    /// partition handle needed to cancel a running vCPU).
    fn as_any(&self) -> &dyn Any;

    /// Store the join handle for this hypervisor's handler thread.
    fn set_handler_join_handle(&mut self, handle: std::thread::JoinHandle<Result<()>>);
    /// Get a mutable reference to this hypervisor's handler thread join
    /// handle, so it can be `take()`n and joined.
    fn get_mut_handler_join_handle(&mut self) -> &mut Option<std::thread::JoinHandle<Result<()>>>;

    /// Record whether the host has requested cancellation of the currently
    /// running (or about to run) vCPU action.
    fn set_termination_status(&mut self, value: bool);
    /// Get the shared cell the host uses to request cancellation.
    fn get_termination_status(&self) -> Arc<AtomicCell<bool>>;

    /// Record whether the in-flight cancellation signal has been observed
    /// by the vCPU thread.
    #[cfg(target_os = "linux")]
    fn set_run_cancelled(&mut self, val: bool);
    /// The pthread id of the thread currently (or most recently) running
    /// this vCPU, used to target the cancellation signal.
    #[cfg(target_os = "linux")]
    fn get_thread_id(&self) -> u64;
    /// Record the pthread id of the thread about to run this vCPU.
    #[cfg(target_os = "linux")]
    fn set_thread_id(&mut self, thread_id: u64);

    /// Create this hypervisor's action/message channels and store them on
    /// `self`. Must be called once before `hypervisor_handler::start_hypervisor_handler`.
    fn setup_hypervisor_handler_communication_channels(&mut self) {
        let (to_handler_tx, to_handler_rx) = crossbeam_channel::unbounded();
        let (from_handler_tx, from_handler_rx) = crossbeam_channel::unbounded();
        self.set_to_handler_tx(to_handler_tx);
        self.set_to_handler_rx(to_handler_rx);
        self.set_from_handler_tx(from_handler_tx);
        self.set_from_handler_rx(from_handler_rx);
    }
}

/// Drive a `Hypervisor`'s vCPU in a loop, servicing `IoOut` exits via
/// `outb_hdl` until it halts, is cancelled, or traps on an unmapped memory
/// access.
pub struct VirtualCPU;

impl VirtualCPU {
    /// Run `hv` until it halts or fails.
    pub fn run(
        hv: &mut dyn Hypervisor,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        loop {
            match hv.run()? {
                SandboxExit::Halt() => return Ok(()),
                SandboxExit::IoOut(port, data, rip, instruction_length) => {
                    hv.handle_io(port, data, rip, instruction_length, outb_hdl.clone())?;
                }
                SandboxExit::Mmio(addr) => {
                    let res = mem_access_hdl
                        .lock()
                        .map_err(|e| new_error!("error locking mem access handler: {}", e))?
                        .call();
                    return match res {
                        Ok(()) => Err(new_error!("guest accessed unmapped memory at {:#x}", addr)),
                        Err(e) => Err(e),
                    };
                }
                SandboxExit::Cancelled() => return Err(SandboxError::ExecutionCanceledByHost),
                SandboxExit::Unknown(s) => return Err(new_error!("unexpected vcpu exit: {}", s)),
            }
        }
    }
}

#[cfg(target_os = "windows")]
thread_local! {
    /// The partition handle of the vCPU currently running on this thread,
    /// used by `terminate_execution` to call `WHvCancelRunVirtualProcessor`
    /// from the main thread while the handler thread is blocked in
    /// `WHvRunVirtualProcessor`.
    pub(crate) static PARTITION_HANDLE: std::sync::Mutex<Option<windows::Win32::System::Hypervisor::WHV_PARTITION_HANDLE>> =
        std::sync::Mutex::new(None);
}

/// Ask the vCPU thread to stop running and wait (up to
/// `max_wait_for_cancellation` on Linux) for it to acknowledge the request.
#[cfg(target_os = "linux")]
pub(crate) fn terminate_execution(
    _max_execution_time: Duration,
    termination_status: Arc<AtomicCell<bool>>,
    run_cancelled: Arc<AtomicCell<bool>>,
    thread_id: u64,
    max_wait_for_cancellation: Duration,
) -> Result<()> {
    use vmm_sys_util::signal::SIGRTMIN;

    termination_status.store(true);
    let start = std::time::Instant::now();
    while !run_cancelled.load() {
        if start.elapsed() > max_wait_for_cancellation {
            return Err(SandboxError::CancellationTimeout);
        }
        unsafe {
            libc::pthread_kill(thread_id as libc::pthread_t, SIGRTMIN());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Ask the vCPU thread to stop running, via `WHvCancelRunVirtualProcessor`.
#[cfg(target_os = "windows")]
pub(crate) fn terminate_execution(
    _max_execution_time: Duration,
    termination_status: Arc<AtomicCell<bool>>,
) -> Result<()> {
    termination_status.store(true);
    let partition_handle = PARTITION_HANDLE.with(|cell| *cell.lock().unwrap());
    if let Some(handle) = partition_handle {
        unsafe {
            windows::Win32::System::Hypervisor::WHvCancelRunVirtualProcessor(handle, 0, 0)
                .map_err(|e| new_error!("WHvCancelRunVirtualProcessor failed: {}", e))?;
        }
    }
    Ok(())
}
