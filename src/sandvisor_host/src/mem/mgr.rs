use super::{
    layout::SandboxMemoryLayout,
    pe::{headers::PEHeaders, pe_info::PEInfo},
    ptr::{GuestPtr, HostPtr, RawPtr},
    ptr_addr_space::{GuestAddressSpace, HostAddressSpace},
    ptr_offset::Offset,
    shared_mem::SharedMemory,
    shared_mem_snapshot::SharedMemorySnapshot,
};
use crate::func::function_call::{FunctionCall, ReadFunctionCallFromMemory, WriteFunctionCallToMemory};
use crate::func::guest::{
    error::{Code, GuestError},
    function_call::GuestFunctionCall,
    log_data::GuestLogData,
};
use crate::func::host::{function_call::HostFunctionCall, function_details::HostFunctionDetails};
use crate::func::types::ReturnValue;
use crate::sandbox::SandboxConfiguration;
use crate::{new_error, Result};
use core::mem::size_of;
use std::cmp::Ordering;

/// Whether or not the 64-bit page directory entry (PDE) record is
/// present.
///
/// See the following links explaining a PDE in various levels of detail:
///
/// * Very basic description: https://stackoverflow.com/a/26945892
/// * More in-depth descriptions: https://wiki.osdev.org/Paging
const PDE64_PRESENT: u64 = 1;
/// Read/write permissions flag for the 64-bit PDE
const PDE64_RW: u64 = 1 << 1;
/// The user/supervisor bit for the 64-bit PDE
const PDE64_USER: u64 = 1 << 2;
/// The page size for the 64-bit PDE
const PDE64_PS: u64 = 1 << 7;

/// The length, in bytes, of the random cookie seeded below the guest's
/// stack to detect stack overflows.
pub(crate) const STACK_COOKIE_LEN: usize = 16;

/// A struct that is responsible for laying out and managing the memory
/// for a given `Sandbox`.
#[derive(Clone)]
pub struct SandboxMemoryManager {
    pub(crate) mem_cfg: SandboxConfiguration,
    mem_snapshot: Option<SharedMemorySnapshot>,
    pub(crate) shared_mem: SharedMemory,
    pub(crate) layout: SandboxMemoryLayout,
    pub(crate) load_addr: RawPtr,
    pub(crate) entrypoint_offset: Offset,
}

impl SandboxMemoryManager {
    /// Create a new `SandboxMemoryManager` with the given parameters
    pub(crate) fn new(
        mem_cfg: SandboxConfiguration,
        layout: SandboxMemoryLayout,
        shared_mem: SharedMemory,
        load_addr: RawPtr,
        entrypoint_offset: Offset,
    ) -> Self {
        Self {
            mem_cfg,
            mem_snapshot: None,
            layout,
            shared_mem,
            load_addr,
            entrypoint_offset,
        }
    }

    /// Set the stack guard to `cookie`, using `self`'s layout to
    /// calculate its location.
    pub(crate) fn set_stack_guard(&mut self, cookie: &[u8; STACK_COOKIE_LEN]) -> Result<()> {
        let stack_offset = self.layout.get_top_of_stack_offset();
        self.shared_mem.copy_from_slice(cookie, usize::try_from(stack_offset)?)
    }

    /// Set up the hypervisor partition in `self`'s `SharedMemory`, with
    /// the given total guest memory size `mem_size`. Returns the initial
    /// stack pointer value.
    pub(crate) fn set_up_hypervisor_partition(&mut self, mem_size: u64) -> Result<u64> {
        // Add 0x200000 because that's the start of mapped memory.
        // Subtract 0x28 so the called entrypoint sees an rsp that looks
        // like it's 16-byte aligned immediately after a `call`.
        let rsp = mem_size + SandboxMemoryLayout::BASE_ADDRESS as u64 - 0x28;

        self.shared_mem.write_u64(
            usize::try_from(SandboxMemoryLayout::PML4_OFFSET)?,
            PDE64_PRESENT | PDE64_RW | PDE64_USER | SandboxMemoryLayout::PDPT_GUEST_ADDRESS as u64,
        )?;
        self.shared_mem.write_u64(
            usize::try_from(SandboxMemoryLayout::PDPT_OFFSET)?,
            PDE64_PRESENT | PDE64_RW | PDE64_USER | SandboxMemoryLayout::PD_GUEST_ADDRESS as u64,
        )?;

        // do not map first 2 megs
        for i in 0..512usize {
            let offset = SandboxMemoryLayout::PD_OFFSET + (i * 8);
            let val_to_write: u64 =
                (i as u64) << 21 | (PDE64_PRESENT | PDE64_RW | PDE64_USER | PDE64_PS);
            self.shared_mem.write_u64(offset, val_to_write)?;
        }
        Ok(rsp)
    }

    /// Check the stack guard against `cookie`, using `self`'s layout to
    /// calculate its location.
    ///
    /// Returns `true` if the guard bytes still match `cookie`, `false`
    /// if they've been overwritten, and `Err` if they couldn't be read.
    pub(crate) fn check_stack_guard(&self, cookie: [u8; STACK_COOKIE_LEN]) -> Result<bool> {
        let offset = usize::try_from(self.layout.get_top_of_stack_offset())?;
        let mut test_cookie = [0u8; STACK_COOKIE_LEN];
        self.shared_mem.copy_to_slice(&mut test_cookie, offset)?;
        Ok(cookie.iter().cmp(test_cookie.iter()) == Ordering::Equal)
    }

    /// Create a new memory snapshot of `self`'s `SharedMemory` and store
    /// it internally, replacing any prior snapshot.
    pub(crate) fn snapshot_state(&mut self) -> Result<()> {
        match &mut self.mem_snapshot {
            Some(snapshot) => snapshot.replace_snapshot(),
            None => {
                self.mem_snapshot = Some(SharedMemorySnapshot::new(self.shared_mem.clone())?);
                Ok(())
            }
        }
    }

    /// Restore memory from the previously-taken snapshot.
    ///
    /// Returns an `Err` if no snapshot has been taken yet.
    pub(crate) fn restore_state(&mut self) -> Result<()> {
        match &mut self.mem_snapshot {
            Some(snapshot) => snapshot.restore_from_snapshot(),
            None => Err(new_error!("restore_state called with no valid snapshot")),
        }
    }

    /// Sets `addr` at the offset in `self`'s `SharedMemory` the guest
    /// reads to find the address of the outb port handler.
    pub(crate) fn set_outb_address(&mut self, addr: u64) -> Result<()> {
        let offset = usize::try_from(self.layout.get_outb_pointer_offset())?;
        self.shared_mem.write_u64(offset, addr)
    }

    /// Convert a pointer in the guest's address space to a pointer in the
    /// host's.
    pub(crate) fn get_host_address_from_ptr(&self, guest_ptr: GuestPtr) -> Result<HostPtr> {
        guest_ptr.to_foreign_ptr(HostAddressSpace::new(&self.shared_mem))
    }

    /// Convert a pointer in the host's address space to a pointer in the
    /// guest's.
    pub(crate) fn get_guest_address_from_ptr(&self, host_ptr: HostPtr) -> Result<GuestPtr> {
        host_ptr.to_foreign_ptr(GuestAddressSpace::new())
    }

    /// Get the length of the host exception, if any, reported for the
    /// call currently in flight.
    pub(crate) fn get_host_exception_length(&self) -> Result<i32> {
        let offset = usize::try_from(self.layout.get_host_exception_offset())?;
        self.shared_mem.read_i32(offset)
    }

    /// Returns `true` if a host exception was recorded for the call
    /// currently in flight.
    pub(crate) fn has_host_exception(&self) -> Result<bool> {
        Ok(self.get_host_exception_length()? != 0)
    }

    /// Copy the recorded host exception payload into `exception_data`.
    ///
    /// `exception_data`'s length must match the length previously
    /// reported by `get_host_exception_length`.
    pub(crate) fn get_host_exception_data(&self, exception_data: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(self.layout.get_host_exception_offset())?;
        let len = self.shared_mem.read_i32(offset)?;
        if exception_data.len() != len as usize {
            return Err(new_error!(
                "host exception data length mismatch: got {}, expected {}",
                exception_data.len(),
                len
            ));
        }
        self.shared_mem.copy_to_slice(exception_data, offset + size_of::<i32>())
    }

    /// Record a host exception that occurred while servicing an outb
    /// call from the guest, and write a matching `GuestError` alongside
    /// it so the guest can see why its call failed.
    pub(crate) fn write_outb_exception(
        &mut self,
        guest_error_msg: &[u8],
        host_exception_data: &[u8],
    ) -> Result<()> {
        let message = String::from_utf8_lossy(guest_error_msg).into_owned();
        let ge = GuestError::new(Code::OutbError, message);
        ge.write_to_memory(&mut self.shared_mem, &self.layout)?;

        let host_exception_offset = usize::try_from(self.layout.get_host_exception_offset())?;
        let host_exception_size_offset =
            usize::try_from(self.layout.get_host_exception_size_offset())?;
        let max_host_exception_size =
            usize::try_from(self.shared_mem.read_u64(host_exception_size_offset)?)?;

        if host_exception_data.len() > max_host_exception_size - size_of::<i32>() {
            return Err(new_error!(
                "host exception message is too large: max size is {}, got {}",
                max_host_exception_size,
                host_exception_data.len()
            ));
        }

        self.shared_mem
            .write_i32(host_exception_offset, host_exception_data.len() as i32)?;
        self.shared_mem
            .copy_from_slice(host_exception_data, host_exception_offset + size_of::<i32>())
    }

    /// Get the guest error, if any, reported for the call currently in
    /// flight.
    pub(crate) fn get_guest_error(&self) -> Result<GuestError> {
        GuestError::try_from((&self.shared_mem, &self.layout))
    }

    /// Load the binary represented by `pe_info` into memory, applying
    /// relocations as needed, and build a fresh `SandboxMemoryManager`
    /// describing it.
    pub(crate) fn load_guest_binary_into_memory(
        cfg: SandboxConfiguration,
        pe_info: &mut PEInfo,
    ) -> Result<Self> {
        let (layout, mut shared_mem, load_addr, entrypoint_offset) =
            load_guest_binary_common(cfg, pe_info, pe_info.get_payload_len(), |_shared_mem| {
                RawPtr::try_from(SandboxMemoryLayout::GUEST_CODE_ADDRESS)
            })?;

        let relocation_patches = pe_info
            .get_exe_relocation_patches(pe_info.get_payload(), load_addr.clone().try_into()?)?;
        PEInfo::apply_relocation_patches(pe_info.get_payload_mut(), relocation_patches)?;
        let code_offset = usize::try_from(SandboxMemoryLayout::CODE_OFFSET)?;
        shared_mem.copy_from_slice(pe_info.get_payload(), code_offset)?;

        Ok(Self::new(cfg, layout, shared_mem, load_addr, entrypoint_offset))
    }

    /// Writes a guest function call to memory
    pub(crate) fn write_guest_function_call(&mut self, buffer: &[u8]) -> Result<()> {
        GuestFunctionCall {}.write(buffer, &mut self.shared_mem, &self.layout)
    }

    /// Writes the current set of registered host function details to
    /// memory so the guest can discover them.
    pub(crate) fn write_buffer_host_function_details(&mut self, buffer: &[u8]) -> Result<()> {
        let host_function_details = HostFunctionDetails::try_from(buffer)?;
        host_function_details.write_to_memory(&mut self.shared_mem, &self.layout)
    }

    /// Reads a host function call, issued by the guest, from memory.
    pub(crate) fn get_host_function_call(&self) -> Result<FunctionCall> {
        let buffer = HostFunctionCall {}.read(&self.shared_mem, &self.layout)?;
        FunctionCall::try_from(buffer.as_slice())
    }

    /// Writes the result of a host function call back to the guest.
    pub(crate) fn write_response_from_host_method_call(&mut self, res: &ReturnValue) -> Result<()> {
        let bytes = Vec::<u8>::try_from(res)?;
        let offset = usize::try_from(self.layout.output_data_buffer_offset)?;
        self.shared_mem.copy_from_slice(&bytes, offset)
    }

    /// Reads the final return value of a completed guest function call.
    pub(crate) fn get_function_call_result(&self) -> Result<ReturnValue> {
        ReturnValue::try_from(self)
    }

    /// Read guest log data recorded for the call currently in flight.
    pub(crate) fn read_guest_log_data(&self) -> Result<GuestLogData> {
        GuestLogData::try_from((&self.shared_mem, self.layout.clone()))
    }

    /// Read the address of the guest's dispatch function, written by the
    /// guest entrypoint during vCPU initialisation.
    pub(crate) fn get_pointer_to_dispatch_function(&self) -> Result<u64> {
        let offset = usize::try_from(self.layout.get_dispatch_function_pointer_offset())?;
        self.shared_mem.read_u64(offset)
    }
}

/// Common setup functionality for `load_guest_binary_into_memory`.
///
/// Returns the newly created `SandboxMemoryLayout`, newly created
/// `SharedMemory`, load address as calculated by `load_addr_fn`,
/// and calculated entrypoint offset, in order.
fn load_guest_binary_common<F>(
    cfg: SandboxConfiguration,
    pe_info: &PEInfo,
    code_size: usize,
    load_addr_fn: F,
) -> Result<(SandboxMemoryLayout, SharedMemory, RawPtr, Offset)>
where
    F: FnOnce(&SharedMemory) -> Result<RawPtr>,
{
    let layout = SandboxMemoryLayout::new(
        cfg,
        code_size,
        usize::try_from(cfg.get_stack_size(pe_info))?,
        usize::try_from(cfg.get_heap_size(pe_info))?,
    )?;
    let mut shared_mem = SharedMemory::new(layout.get_memory_size()?)?;

    let load_addr = load_addr_fn(&shared_mem)?;

    let entrypoint_offset = Offset::from({
        let pe_headers = PEHeaders::from(pe_info);
        pe_headers.entrypoint_offset
    });

    let offset = layout.get_code_pointer_offset();
    let load_addr_u64: u64 = load_addr.clone().try_into()?;
    shared_mem.write_u64(usize::try_from(offset)?, load_addr_u64)?;

    Ok((layout, shared_mem, load_addr, entrypoint_offset))
}

#[cfg(test)]
mod tests {
    use crate::mem::{pe::pe_info::PEInfo, ptr::RawPtr};
    use crate::sandbox::SandboxConfiguration;
    use crate::testing::{bytes_for_path, simple_guest_buf};

    #[test]
    fn load_guest_binary_common() {
        let guest = simple_guest_buf();
        let guest_bytes = bytes_for_path(guest).unwrap();
        let pe_info = PEInfo::new(guest_bytes.as_slice()).unwrap();
        let cfg = SandboxConfiguration::new(
            0x4000,
            0x4000,
            0x1000,
            0x4000,
            0x100,
            Some(0x3000),
            Some(0x10000),
            None,
            None,
        );
        let (layout, shared_mem, _, _) =
            super::load_guest_binary_common(cfg, &pe_info, 100, |_| Ok(RawPtr::from(100)))
                .unwrap();
        assert_eq!(layout.get_memory_size().unwrap(), shared_mem.mem_size());
    }
}
