use core::ffi::c_void;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{Receiver, Sender};
use tracing::{instrument, Span};
use windows::Win32::System::Hypervisor::{
    WHvX64RegisterCr0, WHvX64RegisterCr3, WHvX64RegisterCr4, WHvX64RegisterCs, WHvX64RegisterEfer,
    WHvX64RegisterR8, WHvX64RegisterRcx, WHvX64RegisterRdx, WHvX64RegisterRflags,
    WHvX64RegisterRip, WHvX64RegisterRsp, WHvMapGpaRangeFlagExecute, WHvMapGpaRangeFlagRead,
    WHvMapGpaRangeFlagWrite, WHV_PARTITION_HANDLE, WHV_REGISTER_NAME, WHV_REGISTER_VALUE,
    WHV_RUN_VP_EXIT_REASON, WHV_X64_SEGMENT_REGISTER, WHV_X64_SEGMENT_REGISTER_0,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use super::handlers::{MemAccessHandlerWrapper, OutBHandlerWrapper};
use super::hypervisor_handler::{HandlerMsg, HasCommunicationChannels, VCPUAction};
use super::windows_hypervisor_platform::{self as whp, VMPartition, VMProcessor};
use super::{Hypervisor, SandboxExit, VirtualCPU};
use crate::mem::memory_region::MemoryRegion;
use crate::mem::ptr::{GuestPtr, RawPtr};
use crate::{log_then_return, new_error, Result, SandboxError};

const CR4_PAE: u64 = 1 << 5;
const CR4_OSFXSR: u64 = 1 << 9;
const CR4_OSXMMEXCPT: u64 = 1 << 10;
const CR0_PE: u64 = 1;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_AM: u64 = 1 << 18;
const CR0_PG: u64 = 1 << 31;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// Wraps `WHV_REGISTER_NAME` so it can key a `HashMap` of register values;
/// the underlying type is a thin `i32` newtype and doesn't derive `Hash`
/// itself.
#[derive(Debug, Clone, Copy)]
pub(super) struct WhvRegisterNameWrapper(pub(super) WHV_REGISTER_NAME);

impl PartialEq for WhvRegisterNameWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0 .0 == other.0 .0
    }
}

impl Eq for WhvRegisterNameWrapper {}

impl std::hash::Hash for WhvRegisterNameWrapper {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0 .0.hash(state);
    }
}

/// A Hypervisor driver for HyperV-on-Windows, backed by the Windows
/// Hypervisor Platform (WHP) API.
///
/// Guest memory is mapped directly into this process via `GetCurrentProcess`,
/// rather than via a separate surrogate process: WHP allows more than one
/// partition per process, which this crate never needs more than one of.
pub(crate) struct HypervWindowsDriver {
    size: usize,
    processor: VMProcessor,
    entrypoint: u64,
    orig_rsp: GuestPtr,
    termination_status: Arc<AtomicCell<bool>>,
    handler_join_handle: Option<std::thread::JoinHandle<Result<()>>>,
    to_handler_tx: Option<Sender<VCPUAction>>,
    to_handler_rx: Option<Receiver<VCPUAction>>,
    from_handler_tx: Option<Sender<HandlerMsg>>,
    from_handler_rx: Option<Receiver<HandlerMsg>>,
}

impl HypervWindowsDriver {
    /// Create a new instance of a `HypervWindowsDriver` for a guest with the
    /// given page table root, entrypoint, stack pointer, and memory layout.
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    pub(crate) fn new(
        mem_regions: &[MemoryRegion],
        raw_size: usize,
        raw_source_address: *mut c_void,
        pml4_address: u64,
        entrypoint: u64,
        rsp: u64,
    ) -> Result<Self> {
        if !whp::is_hypervisor_present()? {
            log_then_return!(SandboxError::NoHypervisorFound);
        }
        let _ = mem_regions;

        let mut partition = VMPartition::new(1)?;
        let process_handle = unsafe { GetCurrentProcess() };
        partition.map_gpa_range(
            &process_handle,
            raw_source_address,
            0,
            raw_size,
            WHvMapGpaRangeFlagRead | WHvMapGpaRangeFlagWrite | WHvMapGpaRangeFlagExecute,
        )?;

        let mut processor = VMProcessor::new(partition)?;
        Self::set_initial_registers(&mut processor, pml4_address)?;

        Ok(Self {
            size: raw_size,
            processor,
            entrypoint,
            orig_rsp: GuestPtr::try_from(RawPtr::from(rsp))?,
            termination_status: Arc::new(AtomicCell::new(false)),
            handler_join_handle: None,
            to_handler_tx: None,
            to_handler_rx: None,
            from_handler_tx: None,
            from_handler_rx: None,
        })
    }

    fn set_initial_registers(processor: &mut VMProcessor, pml4_addr: u64) -> Result<()> {
        let registers = HashMap::from([
            (
                WhvRegisterNameWrapper(WHvX64RegisterCr3),
                WHV_REGISTER_VALUE { Reg64: pml4_addr },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterCr4),
                WHV_REGISTER_VALUE {
                    Reg64: CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT,
                },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterCr0),
                WHV_REGISTER_VALUE {
                    Reg64: CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG,
                },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterEfer),
                WHV_REGISTER_VALUE {
                    Reg64: EFER_LME | EFER_LMA,
                },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterCs),
                WHV_REGISTER_VALUE {
                    Segment: WHV_X64_SEGMENT_REGISTER {
                        Anonymous: WHV_X64_SEGMENT_REGISTER_0 {
                            // Type (11: Execute/Read, accessed) | L (64-bit) | P (present) | S (code segment)
                            Attributes: 0b1011 | 1 << 4 | 1 << 7 | 1 << 13,
                        },
                        ..Default::default()
                    },
                },
            ),
        ]);
        processor.set_registers(&registers)?;
        Ok(())
    }

    fn set_register(&mut self, name: WHV_REGISTER_NAME, value: u64) -> Result<()> {
        let registers = HashMap::from([(
            WhvRegisterNameWrapper(name),
            WHV_REGISTER_VALUE { Reg64: value },
        )]);
        self.processor.set_registers(&registers)
    }

    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub(super) fn get_partition_hdl(&self) -> WHV_PARTITION_HANDLE {
        self.processor.get_partition_hdl()
    }
}

impl std::fmt::Debug for HypervWindowsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervWindowsDriver")
            .field("size", &self.size)
            .field("entrypoint", &self.entrypoint)
            .finish()
    }
}

impl Hypervisor for HypervWindowsDriver {
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn initialise(
        &mut self,
        peb_addr: RawPtr,
        seed: u64,
        page_size: u32,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        let registers = HashMap::from([
            (
                WhvRegisterNameWrapper(WHvX64RegisterRip),
                WHV_REGISTER_VALUE { Reg64: self.entrypoint },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterRsp),
                WHV_REGISTER_VALUE { Reg64: self.orig_rsp.absolute()? },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterRcx),
                WHV_REGISTER_VALUE { Reg64: u64::from(peb_addr) },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterRdx),
                WHV_REGISTER_VALUE { Reg64: seed },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterR8),
                WHV_REGISTER_VALUE { Reg64: page_size as u64 },
            ),
            (
                WhvRegisterNameWrapper(WHvX64RegisterRflags),
                // eflags bit index 1 is reserved and always needs to be 1
                WHV_REGISTER_VALUE { Reg64: 1 << 1 },
            ),
        ]);
        self.processor.set_registers(&registers)?;
        VirtualCPU::run(self, outb_hdl, mem_access_hdl)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn dispatch_call_from_host(
        &mut self,
        dispatch_func_addr: RawPtr,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        self.set_register(WHvX64RegisterRip, u64::from(dispatch_func_addr))?;
        VirtualCPU::run(self, outb_hdl, mem_access_hdl)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn handle_io(
        &mut self,
        port: u16,
        data: Vec<u8>,
        rip: u64,
        instruction_length: u64,
        outb_handle_fn: OutBHandlerWrapper,
    ) -> Result<()> {
        let payload_bytes: [u8; 8] = data[..8]
            .try_into()
            .map_err(|_| new_error!("outb payload was not 8 bytes long"))?;
        outb_handle_fn
            .lock()
            .map_err(|e| new_error!("error locking outb handler: {}", e))?
            .call(port, u64::from_le_bytes(payload_bytes))?;

        self.set_register(WHvX64RegisterRip, rip + instruction_length)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn run(&mut self) -> Result<SandboxExit> {
        let exit_context = self.processor.run()?;

        let exit = match exit_context.ExitReason {
            // WHvRunVpExitReasonX64IoPortAccess
            WHV_RUN_VP_EXIT_REASON(2i32) => {
                let instruction_length = exit_context.VpContext._bitfield & 0xF;
                unsafe {
                    SandboxExit::IoOut(
                        exit_context.Anonymous.IoPortAccess.PortNumber,
                        exit_context.Anonymous.IoPortAccess.Rax.to_le_bytes().to_vec(),
                        exit_context.VpContext.Rip,
                        instruction_length as u64,
                    )
                }
            }
            // WHvRunVpExitReasonX64Halt
            WHV_RUN_VP_EXIT_REASON(8i32) => SandboxExit::Halt(),
            // WHvRunVpExitReasonMemoryAccess
            WHV_RUN_VP_EXIT_REASON(1i32) => {
                let gpa = unsafe { exit_context.Anonymous.MemoryAccess.Gpa };
                SandboxExit::Mmio(gpa)
            }
            // WHvRunVpExitReasonCanceled, raised when the host cancels a
            // running vCPU via `WHvCancelRunVirtualProcessor`.
            WHV_RUN_VP_EXIT_REASON(8193i32) => SandboxExit::Cancelled(),
            other => SandboxExit::Unknown(format!("unexpected WHP exit reason {:?}", other)),
        };
        Ok(exit)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn set_handler_join_handle(&mut self, handle: std::thread::JoinHandle<Result<()>>) {
        self.handler_join_handle = Some(handle);
    }

    fn get_mut_handler_join_handle(&mut self) -> &mut Option<std::thread::JoinHandle<Result<()>>> {
        &mut self.handler_join_handle
    }

    fn set_termination_status(&mut self, value: bool) {
        self.termination_status.store(value);
    }

    fn get_termination_status(&self) -> Arc<AtomicCell<bool>> {
        self.termination_status.clone()
    }
}

impl HasCommunicationChannels for HypervWindowsDriver {
    fn get_to_handler_tx(&self) -> Sender<VCPUAction> {
        self.to_handler_tx.clone().expect("to_handler_tx not set")
    }
    fn set_to_handler_tx(&mut self, tx: Sender<VCPUAction>) {
        self.to_handler_tx = Some(tx);
    }
    fn drop_to_handler_tx(&mut self) {
        self.to_handler_tx = None;
    }
    fn get_from_handler_rx(&self) -> Receiver<HandlerMsg> {
        self.from_handler_rx.clone().expect("from_handler_rx not set")
    }
    fn set_from_handler_rx(&mut self, rx: Receiver<HandlerMsg>) {
        self.from_handler_rx = Some(rx);
    }
    fn get_from_handler_tx(&self) -> Sender<HandlerMsg> {
        self.from_handler_tx.clone().expect("from_handler_tx not set")
    }
    fn set_from_handler_tx(&mut self, tx: Sender<HandlerMsg>) {
        self.from_handler_tx = Some(tx);
    }
    fn get_to_handler_rx(&self) -> Receiver<VCPUAction> {
        self.to_handler_rx.clone().expect("to_handler_rx not set")
    }
    fn set_to_handler_rx(&mut self, rx: Receiver<VCPUAction>) {
        self.to_handler_rx = Some(rx);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_is_hypervisor_present() {
        // Just exercises the WHvGetCapability call path; whether a
        // hypervisor is actually present depends on the test host.
        let _ = super::whp::is_hypervisor_present();
    }
}
