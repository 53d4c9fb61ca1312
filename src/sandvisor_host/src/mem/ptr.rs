use super::ptr_addr_space::{AddressSpace, GuestAddressSpace, HostAddressSpace};
use super::ptr_offset::Offset;
use super::shared_mem::SharedMemory;
use crate::{new_error, Result};

/// A representation of a raw pointer inside a given address space.
///
/// Use this type to distinguish between an offset and a raw pointer.
#[derive(Debug, Clone)]
pub struct RawPtr(pub u64);

impl From<u64> for RawPtr {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl From<RawPtr> for u64 {
    fn from(val: RawPtr) -> Self {
        val.0
    }
}

impl std::ops::Add<Offset> for RawPtr {
    type Output = RawPtr;
    fn add(self, rhs: Offset) -> RawPtr {
        RawPtr(self.0 + rhs.as_u64())
    }
}

/// Convenience type for representing a pointer into the host address space.
pub type HostPtr = Ptr<HostAddressSpace>;
impl TryFrom<(RawPtr, &SharedMemory)> for HostPtr {
    type Error = crate::SandboxError;
    /// Create a new `HostPtr` from the given `host_raw_ptr`, which must
    /// be a pointer in the host's address space.
    fn try_from(tup: (RawPtr, &SharedMemory)) -> Result<Self> {
        let (host_raw_ptr, shared_mem) = tup;
        HostPtr::from_raw_ptr(HostAddressSpace::new(shared_mem), host_raw_ptr)
    }
}
/// Convenience type for representing a pointer into the guest address space.
pub type GuestPtr = Ptr<GuestAddressSpace>;
impl TryFrom<RawPtr> for GuestPtr {
    type Error = crate::SandboxError;
    /// Create a new `GuestPtr` from the given `guest_raw_ptr`, which must
    /// be a pointer in the guest's address space.
    fn try_from(raw: RawPtr) -> Result<Self> {
        GuestPtr::from_raw_ptr(GuestAddressSpace::new(), raw)
    }
}

/// A pointer into a specific `AddressSpace` `T`.
#[derive(Clone)]
pub struct Ptr<T: AddressSpace> {
    addr_space: T,
    offset: Offset,
}

impl<T: AddressSpace> Ptr<T> {
    /// Create a new pointer in the given `AddressSpace` `addr_space`
    /// from the given pointer `raw_ptr`. Returns `Err` if subtracting
    /// the base address from `raw_ptr` overflows.
    fn from_raw_ptr(addr_space: T, raw_ptr: RawPtr) -> Result<Ptr<T>> {
        let offset = raw_ptr.0.checked_sub(addr_space.base()).ok_or_else(|| {
            new_error!(
                "from_raw_ptr: raw pointer ({:?}) was less than the base address ({:?})",
                raw_ptr,
                addr_space.base(),
            )
        })?;
        Ok(Self {
            addr_space,
            offset: Offset::from(offset),
        })
    }

    /// Create a new `Ptr<Tgt>` from a source pointer and a target address space.
    fn from_foreign_ptr<Src: AddressSpace, Tgt: AddressSpace>(
        foreign_ptr: &Ptr<Src>,
        target_addr_space: Tgt,
    ) -> Result<Ptr<Tgt>> {
        Ok(Ptr {
            addr_space: target_addr_space,
            offset: foreign_ptr.offset(),
        })
    }

    /// Convert `self` into a new `Ptr` with a different address space.
    pub fn to_foreign_ptr<Tgt: AddressSpace>(&self, target_addr_space: Tgt) -> Result<Ptr<Tgt>> {
        Self::from_foreign_ptr(self, target_addr_space)
    }

    /// Get the base address for this pointer's address space.
    fn base(&self) -> u64 {
        self.addr_space.base()
    }

    /// Get the offset into the pointer's address space.
    pub fn offset(&self) -> Offset {
        self.offset.clone()
    }

    /// Get the absolute address for the pointer represented by `self`.
    ///
    /// Prefer to work with offsets instead; this should rarely be used.
    pub fn absolute(&self) -> Result<u64> {
        self.base().checked_add(self.offset.as_u64()).ok_or_else(|| {
            new_error!(
                "couldn't add pointer offset {} to base {}",
                self.offset.as_u64(),
                self.base(),
            )
        })
    }
}

impl<T: AddressSpace> std::ops::Add<Offset> for Ptr<T> {
    type Output = Ptr<T>;
    fn add(self, rhs: Offset) -> Ptr<T> {
        Ptr {
            addr_space: self.addr_space,
            offset: self.offset + rhs,
        }
    }
}

impl<T: AddressSpace> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base() == other.base() && self.offset == other.offset
    }
}
impl<T: AddressSpace> PartialOrd for Ptr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.base() != other.base() {
            return None;
        }
        self.offset.partial_cmp(&other.offset)
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::{layout::SandboxMemoryLayout, ptr_addr_space::HostAddressSpace, shared_mem::SharedMemory};

    use super::{GuestPtr, HostPtr, RawPtr};
    const OFFSET: u64 = 1;

    #[test]
    fn ptr_basic_ops() {
        {
            let gm = SharedMemory::new(10).unwrap();
            let raw_host_ptr = RawPtr(OFFSET + gm.base_addr() as u64);
            let host_ptr = HostPtr::try_from((raw_host_ptr, &gm)).unwrap();
            assert_eq!(OFFSET + gm.base_addr() as u64, host_ptr.absolute().unwrap());
        }
        {
            let raw_guest_ptr = RawPtr(OFFSET + SandboxMemoryLayout::BASE_ADDRESS as u64);
            let guest_ptr = GuestPtr::try_from(raw_guest_ptr).unwrap();
            assert_eq!(
                OFFSET + SandboxMemoryLayout::BASE_ADDRESS as u64,
                guest_ptr.absolute().unwrap()
            );
        }
    }

    #[test]
    fn ptr_fail() {
        {
            let gm = SharedMemory::new(10).unwrap();
            let raw_host_ptr = RawPtr(gm.base_addr() as u64 - 1);
            let host_ptr = HostPtr::try_from((raw_host_ptr, &gm));
            assert!(host_ptr.is_err());
        }
        {
            let raw_guest_ptr = RawPtr(SandboxMemoryLayout::BASE_ADDRESS as u64 - 1);
            let guest_ptr = GuestPtr::try_from(raw_guest_ptr);
            assert!(guest_ptr.is_err());
        }
    }

    #[test]
    fn round_trip() {
        let gm = SharedMemory::new(10).unwrap();
        let raw_host_ptr = RawPtr(gm.base_addr() as u64 + OFFSET);

        let host_ptr = HostPtr::try_from((raw_host_ptr, &gm)).unwrap();
        assert_eq!(OFFSET, host_ptr.offset().as_u64());

        let guest_ptr = host_ptr
            .to_foreign_ptr(crate::mem::ptr_addr_space::GuestAddressSpace::new())
            .unwrap();
        assert_eq!(OFFSET, guest_ptr.offset().as_u64());
        assert_eq!(
            OFFSET + SandboxMemoryLayout::BASE_ADDRESS as u64,
            guest_ptr.absolute().unwrap()
        );

        let ret_host_ptr = guest_ptr.to_foreign_ptr(HostAddressSpace::new(&gm)).unwrap();
        assert_eq!(host_ptr.absolute().unwrap(), ret_host_ptr.absolute().unwrap());
    }
}
