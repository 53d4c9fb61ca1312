use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{instrument, Span};

use super::config::SandboxConfiguration;
use super::host_funcs::{default_writer_func, HostFuncsWrapper};
use super::hypervisor::HypervisorWrapper;
use super::mem_access::mem_access_handler_wrapper;
use super::mem_mgr::MemMgrWrapper;
use super::outb::outb_handler_wrapper;
use super::run_options::SandboxRunOptions;
use super::WrapperGetter;
use crate::func::exports::get_os_page_size;
use crate::func::host::function_definition::HostFunctionDefinition;
use crate::func::host::HostFunction1;
use crate::func::SandboxHostFunction;
use crate::hypervisor::hypervisor_handler::{
    execute_vcpu_action, start_hypervisor_handler, InitArgs, VCPUAction,
};
use crate::mem::mgr::{SandboxMemoryManager, STACK_COOKIE_LEN};
use crate::mem::pe::pe_info::PEInfo;
use crate::mem::ptr::RawPtr;
use crate::sandbox_state::sandbox::Sandbox;
use crate::{new_error, MultiUseSandbox, Result};

/// The PE binary a sandbox should run: either its bytes already in memory,
/// or a path to read them from.
#[derive(Debug, Clone)]
pub enum GuestBinary {
    /// The guest's PE bytes, already loaded.
    Buffer(Vec<u8>),
    /// A path to a PE file on disk.
    File(PathBuf),
}

impl GuestBinary {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            GuestBinary::Buffer(bytes) => Ok(bytes),
            GuestBinary::File(path) => fs::read(&path)
                .map_err(|e| new_error!("failed to read guest binary at {:?}: {}", path, e)),
        }
    }
}

/// A sandbox that has had its guest binary loaded and memory laid out, but
/// has not yet had its vCPU initialised.
///
/// Register host functions against a `&mut UninitializedSandbox` (via the
/// `HostFunctionN` traits), then call `initialize` to hand it over to the
/// guest's entrypoint and get back a `MultiUseSandbox`.
pub struct UninitializedSandbox {
    pub(crate) host_funcs: Arc<Mutex<HostFuncsWrapper<'static>>>,
    pub(crate) mgr: MemMgrWrapper,
    pub(crate) hv: HypervisorWrapper<'static>,
    pub(crate) run_options: SandboxRunOptions,
}

impl std::fmt::Debug for UninitializedSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UninitializedSandbox")
            .field("run_options", &self.run_options)
            .finish()
    }
}

impl Sandbox for UninitializedSandbox {}

impl WrapperGetter<'static> for UninitializedSandbox {
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

impl UninitializedSandbox {
    /// Create a new `UninitializedSandbox` from `guest_binary`, laying out
    /// its memory according to `cfg` and setting up a hypervisor partition
    /// to run it in.
    #[instrument(err(Debug), skip(guest_binary), parent = Span::current())]
    pub fn new(
        guest_binary: GuestBinary,
        cfg: SandboxConfiguration,
        run_options: SandboxRunOptions,
    ) -> Result<Self> {
        let guest_bytes = guest_binary.into_bytes()?;
        let mut pe_info = PEInfo::new(&guest_bytes)?;
        let mgr = SandboxMemoryManager::load_guest_binary_into_memory(cfg, &mut pe_info)?;

        let stack_guard = Self::create_stack_guard();
        let mut mem_mgr_wrapper = MemMgrWrapper::new(mgr, stack_guard);
        mem_mgr_wrapper.write_memory_layout()?;

        let hv_box = Self::set_up_hypervisor_partition(mem_mgr_wrapper.as_mut())?;

        let host_funcs: Arc<Mutex<HostFuncsWrapper<'static>>> = Arc::default();

        let outb_hdl = outb_handler_wrapper(mem_mgr_wrapper.clone(), host_funcs.clone());
        let mem_access_hdl = mem_access_handler_wrapper(mem_mgr_wrapper.clone());
        let hv = HypervisorWrapper::new(
            Some(hv_box),
            outb_hdl,
            mem_access_hdl,
            cfg.max_execution_time(),
            #[cfg(target_os = "linux")]
            cfg.max_wait_for_cancellation(),
        );

        let mut sandbox = Self {
            host_funcs,
            mgr: mem_mgr_wrapper,
            hv,
            run_options,
        };

        let default_writer = Arc::new(Mutex::new(default_writer_func));
        default_writer.register(&mut sandbox, "HostPrint")?;

        Ok(sandbox)
    }

    fn create_stack_guard() -> [u8; STACK_COOKIE_LEN] {
        rand::thread_rng().gen::<[u8; STACK_COOKIE_LEN]>()
    }

    /// Register `func` as a host function named `name`, callable by the
    /// guest.
    ///
    /// This is the method every `HostFunctionN::register` impl calls after
    /// erasing its typed closure into a `SandboxHostFunction`.
    pub(crate) fn register_host_function(
        &mut self,
        hfd: &HostFunctionDefinition,
        func: SandboxHostFunction<'static>,
    ) -> Result<()> {
        self.host_funcs
            .lock()
            .map_err(|_| new_error!("host function registry lock poisoned"))?
            .register_host_function(self.mgr.as_mut(), hfd, func)
    }

    /// Initialise the guest vCPU, running `init_fn` against `self` just
    /// before the guest's entrypoint runs (the usual place to register any
    /// additional host functions the guest will need), then hand control to
    /// the guest and convert `self` into a `MultiUseSandbox`.
    #[instrument(err(Debug), skip_all, parent = Span::current())]
    pub fn initialize<F>(mut self, init_fn: F) -> Result<MultiUseSandbox>
    where
        F: FnOnce(&mut UninitializedSandbox) -> Result<()>,
    {
        init_fn(&mut self)?;

        start_hypervisor_handler(self.hv.get_hypervisor_arc()?)?;

        let peb_addr = {
            let mem_mgr = self.mgr.as_mut();
            RawPtr::from(u64::try_from(mem_mgr.layout.peb_address)?)
        };
        let seed = rand::thread_rng().gen::<u64>();
        let page_size = u32::try_from(get_os_page_size())?;
        let (outb_hdl, mem_access_hdl) = (self.hv.outb_hdl.clone(), self.hv.mem_access_hdl.clone());

        execute_vcpu_action(
            &self.hv,
            VCPUAction::Initialise(InitArgs::new(peb_addr, seed, page_size, outb_hdl, mem_access_hdl)),
            None,
        )?;

        let dispatch_function_addr = self.mgr.as_ref().get_pointer_to_dispatch_function()?;

        MultiUseSandbox::new(
            self.host_funcs,
            self.mgr,
            self.hv,
            self.run_options,
            RawPtr::from(dispatch_function_addr),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{GuestBinary, UninitializedSandbox};
    use crate::func::host::HostFunction1;
    use crate::sandbox::{SandboxConfiguration, SandboxRunOptions};
    use crate::testing::simple_guest_buf;
    use crate::Result;

    fn new_uninit() -> Result<UninitializedSandbox> {
        UninitializedSandbox::new(
            GuestBinary::File(simple_guest_buf()),
            SandboxConfiguration::default(),
            SandboxRunOptions::default(),
        )
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn new_sandbox_from_a_valid_guest_binary() {
        assert!(new_uninit().is_ok());
    }

    #[test]
    fn new_sandbox_from_missing_file_errors() {
        let res = UninitializedSandbox::new(
            GuestBinary::File("/nonexistent/path/to/a/guest.exe".into()),
            SandboxConfiguration::default(),
            SandboxRunOptions::default(),
        );
        assert!(res.is_err());
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn default_host_print_is_registered() {
        let sbox = new_uninit().unwrap();
        assert!(sbox
            .host_funcs
            .clone()
            .lock()
            .unwrap()
            .host_print("test".to_string())
            .is_ok());
    }

    #[test]
    #[ignore = "requires a hardware-virtualized host"]
    fn custom_host_print_is_used() {
        let called = Arc::new(Mutex::new(false));
        let called_clone = called.clone();
        let writer = Arc::new(Mutex::new(move |s: String| -> Result<i32> {
            *called_clone.lock().unwrap() = true;
            Ok(s.len() as i32)
        }));

        let mut sbox = new_uninit().unwrap();
        writer.register(&mut sbox, "HostPrint").unwrap();
        sbox.host_funcs
            .clone()
            .lock()
            .unwrap()
            .host_print("hello".to_string())
            .unwrap();
        assert!(*called.lock().unwrap());
    }
}
