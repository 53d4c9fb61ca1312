use std::any::Any;
use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{Receiver, Sender};
use kvm_bindings::{kvm_regs, kvm_sregs, kvm_userspace_memory_region};
use kvm_ioctls::{Cap::UserMemory, Kvm, VcpuExit, VcpuFd, VmFd};
use tracing::{instrument, Span};

use super::handlers::{MemAccessHandlerWrapper, OutBHandlerWrapper};
use super::hypervisor_handler::{HandlerMsg, HasCommunicationChannels, VCPUAction};
use super::{Hypervisor, SandboxExit};
use crate::mem::memory_region::MemoryRegion;
use crate::mem::ptr::RawPtr;
use crate::{new_error, Result};

const KVM_API_VERSION: i32 = 12;

/// Return `Ok(())` if the KVM API is available, or `Err` otherwise.
pub fn is_present() -> Result<()> {
    let kvm = Kvm::new().map_err(|e| new_error!("opening /dev/kvm: {}", e))?;
    let ver = kvm.get_api_version();
    if ver != KVM_API_VERSION {
        return Err(new_error!(
            "KVM_GET_API_VERSION returned {}, expected {}",
            ver,
            KVM_API_VERSION
        ));
    }
    if !kvm.check_extension(UserMemory) {
        return Err(new_error!("KVM_CAP_USER_MEMORY not supported"));
    }
    Ok(())
}

/// Check if KVM exists on the machine and, if so, open the file descriptor
/// and return a handle to it.
pub fn open() -> Result<Kvm> {
    is_present()?;
    let raw_fd =
        Kvm::open_with_cloexec(false).map_err(|e| new_error!("opening /dev/kvm: {}", e))?;
    Ok(unsafe { Kvm::from_raw_fd(raw_fd) })
}

/// A Hypervisor driver backed by the Linux kernel's own KVM API.
pub struct KvmDriver {
    _kvm: Kvm,
    vm_fd: VmFd,
    vcpu_fd: VcpuFd,
    mem_region: kvm_userspace_memory_region,
    termination_status: Arc<AtomicCell<bool>>,
    run_cancelled: Arc<AtomicCell<bool>>,
    thread_id: Arc<AtomicCell<u64>>,
    handler_join_handle: Option<std::thread::JoinHandle<Result<()>>>,
    to_handler_tx: Option<Sender<VCPUAction>>,
    to_handler_rx: Option<Receiver<VCPUAction>>,
    from_handler_tx: Option<Sender<HandlerMsg>>,
    from_handler_rx: Option<Receiver<HandlerMsg>>,
}

impl KvmDriver {
    /// Create a new `KvmDriver` for a guest with the given page table root,
    /// entrypoint, stack pointer, and memory layout.
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    pub fn new(
        mem_regions: &[MemoryRegion],
        pml4_addr: u64,
        entrypoint: u64,
        rsp: u64,
        guest_phys_addr: u64,
        load_address: u64,
        size: u64,
    ) -> Result<Self> {
        let _ = mem_regions;
        let kvm = open()?;
        let vm_fd = kvm.create_vm().map_err(|e| new_error!("creating kvm vm: {}", e))?;
        let vcpu_fd = vm_fd
            .create_vcpu(0)
            .map_err(|e| new_error!("creating kvm vcpu: {}", e))?;

        let mem_region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr,
            memory_size: size,
            userspace_addr: load_address,
            flags: 0,
        };
        unsafe {
            vm_fd
                .set_user_memory_region(mem_region)
                .map_err(|e| new_error!("mapping kvm guest memory: {}", e))?;
        }

        let mut sregs = vcpu_fd
            .get_sregs()
            .map_err(|e| new_error!("getting kvm sregs: {}", e))?;
        sregs.cr3 = pml4_addr;
        sregs.cr4 = (1 << 5) | (1 << 9) | (1 << 10); // PAE | OSFXSR | OSXMMEXCPT
        sregs.cr0 = (1 << 0) | (1 << 1) | (1 << 4) | (1 << 5) | (1 << 16) | (1 << 18) | (1 << 31);
        sregs.efer = (1 << 8) | (1 << 10); // LME | LMA
        sregs.cs.base = 0;
        sregs.cs.selector = 0;
        sregs.cs.l = 1; // 64-bit code segment
        vcpu_fd
            .set_sregs(&sregs)
            .map_err(|e| new_error!("setting kvm sregs: {}", e))?;

        let mut regs = vcpu_fd
            .get_regs()
            .map_err(|e| new_error!("getting kvm regs: {}", e))?;
        regs.rip = entrypoint;
        regs.rsp = rsp;
        regs.rflags = 0x0002;
        vcpu_fd
            .set_regs(&regs)
            .map_err(|e| new_error!("setting kvm regs: {}", e))?;

        Ok(Self {
            _kvm: kvm,
            vm_fd,
            vcpu_fd,
            mem_region,
            termination_status: Arc::new(AtomicCell::new(false)),
            run_cancelled: Arc::new(AtomicCell::new(false)),
            thread_id: Arc::new(AtomicCell::new(0)),
            handler_join_handle: None,
            to_handler_tx: None,
            to_handler_rx: None,
            from_handler_tx: None,
            from_handler_rx: None,
        })
    }

    fn set_entry_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.vcpu_fd
            .set_regs(regs)
            .map_err(|e| new_error!("setting kvm regs: {}", e))
    }
}

impl std::fmt::Debug for KvmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmDriver").finish()
    }
}

impl Hypervisor for KvmDriver {
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn initialise(
        &mut self,
        peb_addr: RawPtr,
        seed: u64,
        page_size: u32,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        let mut regs = self
            .vcpu_fd
            .get_regs()
            .map_err(|e| new_error!("getting kvm regs: {}", e))?;
        regs.rcx = u64::from(peb_addr);
        regs.rdx = seed;
        regs.r8 = page_size as u64;
        self.set_entry_regs(&regs)?;
        super::VirtualCPU::run(self, outb_hdl, mem_access_hdl)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn dispatch_call_from_host(
        &mut self,
        dispatch_func_addr: RawPtr,
        outb_hdl: OutBHandlerWrapper,
        mem_access_hdl: MemAccessHandlerWrapper,
    ) -> Result<()> {
        let mut regs = self
            .vcpu_fd
            .get_regs()
            .map_err(|e| new_error!("getting kvm regs: {}", e))?;
        regs.rip = u64::from(dispatch_func_addr);
        self.set_entry_regs(&regs)?;
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

        let mut regs = self
            .vcpu_fd
            .get_regs()
            .map_err(|e| new_error!("getting kvm regs: {}", e))?;
        regs.rip = rip + instruction_length;
        self.set_entry_regs(&regs)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current())]
    fn run(&mut self) -> Result<SandboxExit> {
        match self.vcpu_fd.run() {
            Ok(VcpuExit::Hlt) => Ok(SandboxExit::Halt()),
            Ok(VcpuExit::IoOut(port, data)) => {
                let regs = self
                    .vcpu_fd
                    .get_regs()
                    .map_err(|e| new_error!("getting kvm regs: {}", e))?;
                let mut payload = [0u8; 8];
                payload[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
                Ok(SandboxExit::IoOut(port, payload.to_vec(), regs.rip, 0))
            }
            Ok(other) => Ok(SandboxExit::Unknown(format!("{:?}", other))),
            Err(e) => {
                if self.termination_status.load() {
                    self.run_cancelled.store(true);
                    return Ok(SandboxExit::Cancelled());
                }
                Err(new_error!("running kvm vcpu: {}", e))
            }
        }
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

impl HasCommunicationChannels for KvmDriver {
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

impl Drop for KvmDriver {
    fn drop(&mut self) {
        let mut unmap = self.mem_region;
        unmap.memory_size = 0;
        unsafe {
            if let Err(e) = self.vm_fd.set_user_memory_region(unmap) {
                tracing::warn!("failed to unmap kvm guest memory: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    const SHOULD_BE_PRESENT_VAR: &str = "KVM_SHOULD_BE_PRESENT";

    fn should_be_present() -> bool {
        std::env::var(SHOULD_BE_PRESENT_VAR).is_ok()
    }

    #[test]
    fn is_present() {
        let pres = super::is_present().is_ok();
        match (should_be_present(), pres) {
            (true, false) => panic!("KVM was not present but should be"),
            (false, true) => panic!("KVM was present but should not be"),
            _ => (),
        }
    }

    #[test]
    fn open_vm_vcpu() {
        if !should_be_present() {
            return;
        }
        let kvm = super::open().unwrap();
        let vm = kvm.create_vm().unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        vcpu.get_regs().unwrap();
        vcpu.get_sregs().unwrap();
    }
}
