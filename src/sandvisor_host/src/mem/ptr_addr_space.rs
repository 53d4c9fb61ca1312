use super::{layout::SandboxMemoryLayout, shared_mem::SharedMemory};

/// A representation of a specific address space
pub trait AddressSpace {
    /// The base address for this address space
    fn base(&self) -> u64;
}

/// The address space for the guest executable, as seen from inside the
/// hypervisor partition.
#[derive(Debug)]
pub struct GuestAddressSpace(u64);
impl GuestAddressSpace {
    /// Create a new instance of a `GuestAddressSpace`
    pub fn new() -> Self {
        Self(SandboxMemoryLayout::BASE_ADDRESS as u64)
    }
}
impl AddressSpace for GuestAddressSpace {
    fn base(&self) -> u64 {
        self.0
    }
}

/// The address space for the host process.
#[derive(Debug)]
pub struct HostAddressSpace(u64);
impl HostAddressSpace {
    /// Create a new instance of a `HostAddressSpace`, using `shared_mem`'s
    /// base address.
    pub fn new(shared_mem: &SharedMemory) -> Self {
        Self(shared_mem.base_addr() as u64)
    }
}
impl AddressSpace for HostAddressSpace {
    fn base(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::shared_mem::SharedMemory;

    use super::{AddressSpace, GuestAddressSpace, HostAddressSpace};

    #[test]
    fn host_addr_space_base() {
        let sm = SharedMemory::new(4096).unwrap();
        let space = HostAddressSpace::new(&sm);
        assert_eq!(sm.base_addr() as u64, space.base());
    }

    #[test]
    fn guest_addr_space_base() {
        let space = GuestAddressSpace::new();
        assert_eq!(SandboxMemoryLayout::BASE_ADDRESS as u64, space.base());
    }
}
