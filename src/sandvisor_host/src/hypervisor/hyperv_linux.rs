use std::any::Any;
use std::sync::{Arc, Mutex};

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{Receiver, Sender};
use mshv_bindings::*;
use mshv_ioctls::{Mshv, VcpuFd, VmFd};
use tracing::{instrument, Span};

use super::handlers::{MemAccessHandlerWrapper, OutBHandlerWrapper};
use super::hypervisor_handler::{HandlerMsg, HasCommunicationChannels, VCPUAction};
use super::{Hypervisor, SandboxExit, U128};
use crate::mem::memory_region::MemoryRegion;
use crate::mem::ptr::RawPtr;
use crate::{new_error, Result};

/// Determine whether the HyperV for Linux hypervisor API is present
/// and functional. If `require_stable_api` is true, determines only whether a
/// stable API for the Linux HyperV hypervisor is present.
pub fn is_hypervisor_present(require_stable_api: bool) -> Result<bool> {
    let mshv = Mshv::new().map_err(|e| new_error!("opening /dev/mshv: {}", e))?;
    match mshv.check_stable() {
        Ok(stable) => {
            if stable {
                Ok(true)
            } else {
                Ok(!require_stable_api)
            }
        }
        Err(e) => Err(new_error!("checking mshv stability: {}", e)),
    }
}

/// The constant to map guest physical addresses as readable
/// in an mshv memory region
pub const HV_MAP_GPA_READABLE: u32 = 1;
/// The constant to map guest physical addresses as writable
/// in an mshv memory region
pub const HV_MAP_GPA_WRITABLE: u32 = 2;
/// The constant to map guest physical addresses as executable
/// in an mshv memory region
pub const HV_MAP_GPA_EXECUTABLE: u32 = 12;
const HV_X64_REGISTER_CR0: u32 = 262144;
const HV_X64_REGISTER_CR3: u32 = 262146;
const HV_X64_REGISTER_CR4: u32 = 262147;
const HV_X64_REGISTER_EFER: u32 = 524289;
const HV_X64_REGISTER_RIP: u32 = 131088;
const HV_X64_REGISTER_RFLAGS: u32 = 131089;
const HV_X64_REGISTER_CS: u32 = 393217;
const HV_X64_REGISTER_RSP: u32 = 131076;
const HV_X64_REGISTER_RCX: u32 = 131072;
const HV_X64_REGISTER_RDX: u32 = 131074;
const HV_X64_REGISTER_R8: u32 = 131080;
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

/// A Hypervisor driver for HyperV-on-Linux. This hypervisor is often
/// called the Microsoft Hypervisor Platform (MSHV).
pub struct HypervLinuxDriver {
    _mshv: Mshv,
    vm_fd: VmFd,
    vcpu_fd: VcpuFd,
    mem_region: mshv_user_mem_region,
    registers: Vec<hv_register_assoc>,
    termination_status: Arc<AtomicCell<bool>>,
    run_cancelled: Arc<AtomicCell<bool>>,
    thread_id: Arc<AtomicCell<u64>>,
    handler_join_handle: Option<std::thread::JoinHandle<Result<()>>>,
    to_handler_tx: Option<Sender<VCPUAction>>,
    to_handler_rx: Option<Receiver<VCPUAction>>,
    from_handler_tx: Option<Sender<HandlerMsg>>,
    from_handler_rx: Option<Receiver<HandlerMsg>>,
}

impl HypervLinuxDriver {
    /// Create a new instance of a `HypervLinuxDriver` for a guest with the
    /// given page table root, entrypoint, stack pointer, and memory layout.
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    pub fn new(
        require_stable_api: bool,
        mem_regions: &[MemoryRegion],
        pml4_addr: u64,
        entrypoint: u64,
        rsp: u64,
        guest_pfn: u64,
        load_address: u64,
        size: u64,
    ) -> Result<Self> {
        match is_hypervisor_present(require_stable_api) {
            Ok(true) => (),
            Ok(false) => {
                return Err(new_error!(
                    "MSHV not present (stable api required: {})",
                    require_stable_api
                ))
            }
            Err(e) => return Err(e),
        }
        let _ = mem_regions;
        let mshv = Mshv::new().map_err(|e| new_error!("opening /dev/mshv: {}", e))?;
        let pr = Default::default();
        let vm_fd = mshv
            .create_vm_with_config(&pr)
            .map_err(|e| new_error!("creating mshv vm: {}", e))?;
        let vcpu_fd = vm_fd
            .create_vcpu(0)
            .map_err(|e| new_error!("creating mshv vcpu: {}", e))?;
        let mem_region = mshv_user_mem_region {
            flags: HV_MAP_GPA_READABLE | HV_MAP_GPA_WRITABLE | HV_MAP_GPA_EXECUTABLE,
            guest_pfn,
            size,
            userspace_addr: load_address,
        };

        vm_fd
            .map_user_memory(mem_region)
            .map_err(|e| new_error!("mapping mshv guest memory: {}", e))?;

        let mut ret = Self {
            _mshv: mshv,
            vm_fd,
            vcpu_fd,
            mem_region,
            registers: Vec::new(),
            termination_status: Arc::new(AtomicCell::new(false)),
            run_cancelled: Arc::new(AtomicCell::new(false)),
            thread_id: Arc::new(AtomicCell::new(0)),
            handler_join_handle: None,
            to_handler_tx: None,
            to_handler_rx: None,
            from_handler_tx: None,
            from_handler_rx: None,
        };
        ret.add_register(HV_X64_REGISTER_CR3, U128::from(pml4_addr));
        ret.add_register(
            HV_X64_REGISTER_CR4,
            U128::from(CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT),
        );
        ret.add_register(
            HV_X64_REGISTER_CR0,
            U128::from(CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG),
        );
        ret.add_register(HV_X64_REGISTER_EFER, U128::from(EFER_LME | EFER_LMA));
        ret.add_register(
            HV_X64_REGISTER_CS,
            U128 {
                low: 0,
                high: 0xa09b0008ffffffff,
            },
        );
        ret.add_register(HV_X64_REGISTER_RFLAGS, U128::from(0x0002));
        ret.add_register(HV_X64_REGISTER_RIP, U128::from(entrypoint));
        ret.add_register(HV_X64_REGISTER_RSP, U128::from(rsp));
        ret.set_registers()?;
        ret.registers.clear();
        Ok(ret)
    }

    fn add_register(&mut self, reg_name: u32, val: U128) {
        let native_reg = hv_register_assoc {
            name: reg_name,
            reserved1: 0,
            reserved2: 0,
            value: hv_register_value::from(val),
        };
        self.registers.push(native_reg);
    }

    fn set_registers(&self) -> Result<()> {
        self.vcpu_fd
            .set_reg(self.registers.as_slice())
            .map_err(|e| new_error!("setting mshv vcpu registers: {}", e))
    }

    fn run_vcpu(&self) -> Result<hv_message> {
        let hv_message: hv_message = Default::default();
        self.vcpu_fd
            .run(hv_message)
            .map_err(|e| new_error!("running mshv vcpu: {}", e))
    }
}

impl std::fmt::Debug for HypervLinuxDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervLinuxDriver").finish()
    }
}

impl Hypervisor for HypervLinuxDriver {
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn initialise(
        &mut self,
        peb_addr: RawPtr,
        seed: u64,
        page_size: u32,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        self.add_register(HV_X64_REGISTER_RCX, U128::from(u64::from(peb_addr)));
        self.add_register(HV_X64_REGISTER_RDX, U128::from(seed));
        self.add_register(HV_X64_REGISTER_R8, U128::from(page_size as u64));
        self.set_registers()?;
        self.registers.clear();
        super::VirtualCPU::run(self, outb_hdl, mem_access_hdl)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn dispatch_call_from_host(
        &mut self,
        dispatch_func_addr: RawPtr,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        self.add_register(HV_X64_REGISTER_RIP, U128::from(u64::from(dispatch_func_addr)));
        self.set_registers()?;
        self.registers.clear();
        super::VirtualCPU::run(self, outb_hdl, mem_access_hdl)
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

        self.add_register(HV_X64_REGISTER_RIP, U128::from(rip + instruction_length));
        self.set_registers()?;
        self.registers.clear();
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn run(&mut self) -> Result<SandboxExit> {
        const HALT_MESSAGE: hv_message_type = hv_message_type_HVMSG_X64_HALT;
        const IO_PORT_INTERCEPT_MESSAGE: hv_message_type =
            hv_message_type_HVMSG_X64_IO_PORT_INTERCEPT;
        const UNMAPPED_GPA_MESSAGE: hv_message_type = hv_message_type_HVMSG_UNMAPPED_GPA;

        let run_res = match self.run_vcpu() {
            Ok(msg) => msg,
            Err(e) => {
                if self.termination_status.load() {
                    self.run_cancelled.store(true);
                    return Ok(SandboxExit::Cancelled());
                }
                return Err(e);
            }
        };
        let exit = match run_res.header.message_type {
            HALT_MESSAGE => SandboxExit::Halt(),
            IO_PORT_INTERCEPT_MESSAGE => {
                let msg: hv_x64_io_port_intercept_message = run_res
                    .to_ioport_info()
                    .map_err(|e| new_error!("reading io port intercept message: {}", e))?;
                SandboxExit::IoOut(
                    msg.port_number,
                    msg.rax.to_le_bytes().to_vec(),
                    msg.header.rip,
                    msg.header.instruction_length() as u64,
                )
            }
            UNMAPPED_GPA_MESSAGE => {
                let msg: hv_x64_memory_intercept_message = run_res
                    .to_memory_info()
                    .map_err(|e| new_error!("reading unmapped gpa message: {}", e))?;
                SandboxExit::Mmio(msg.guest_physical_address)
            }
            other => SandboxExit::Unknown(format!("unknown Hyper-V run message type {:?}", other)),
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

    fn set_run_cancelled(&mut self, val: bool) {
        self.run_cancelled.store(val);
    }

    fn get_thread_id(&self) -> u64 {
        self.thread_id.load()
    }

    fn set_thread_id(&mut self, thread_id: u64) {
        self.thread_id.store(thread_id);
    }
}

impl HasCommunicationChannels for HypervLinuxDriver {
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

impl Drop for HypervLinuxDriver {
    fn drop(&mut self) {
        if let Err(e) = self.vm_fd.unmap_user_memory(self.mem_region) {
            tracing::warn!("failed to unmap mshv guest memory: {:?}", e);
        }
    }
}

#[cfg(test)]
pub mod test_cfg {
    use once_cell::sync::Lazy;
    use serde::Deserialize;

    pub static TEST_CONFIG: Lazy<TestConfig> = Lazy::new(|| match envy::from_env::<TestConfig>() {
        Ok(config) => config,
        Err(err) => panic!("error parsing config from env: {}", err),
    });
    pub static SHOULD_RUN_TEST: Lazy<bool> = Lazy::new(is_mshv_present);

    fn is_mshv_present() -> bool {
        let is_present =
            super::is_hypervisor_present(TEST_CONFIG.should_have_stable_api).unwrap_or(false);
        if is_present != TEST_CONFIG.mshv_should_be_present {
            panic!(
                "MSHV present returned {}, should be present is {}",
                is_present, TEST_CONFIG.mshv_should_be_present
            );
        }
        is_present
    }

    fn mshv_should_be_present_default() -> bool {
        false
    }

    fn should_have_stable_api_default() -> bool {
        false
    }

    #[derive(Deserialize, Debug)]
    pub struct TestConfig {
        #[serde(default = "mshv_should_be_present_default")]
        pub mshv_should_be_present: bool,
        #[serde(default = "should_have_stable_api_default")]
        pub should_have_stable_api: bool,
    }

    #[macro_export]
    macro_rules! should_run_hyperv_linux_test {
        () => {{
            if !(*$crate::hypervisor::hyperv_linux::test_cfg::SHOULD_RUN_TEST) {
                return;
            }
        }};
    }
}

#[cfg(test)]
mod tests {
    use super::test_cfg::TEST_CONFIG;

    #[test]
    fn test_is_hypervisor_present() {
        let result = super::is_hypervisor_present(true).unwrap_or(false);
        assert_eq!(
            result,
            TEST_CONFIG.mshv_should_be_present && TEST_CONFIG.should_have_stable_api
        );
        let result = super::is_hypervisor_present(false).unwrap_or(false);
        assert_eq!(result, TEST_CONFIG.mshv_should_be_present);
    }
}
