use core::ffi::c_void;

/// Number of bits a guest physical address must be shifted right by to get
/// its containing page number.
pub const PAGE_SHIFT: u64 = 12;
/// Size, in bytes, of a single guest memory page.
pub const PAGE_SIZE_USIZE: usize = 1 << PAGE_SHIFT;

/// A `{size, buffer}` pair describing one fixed-size region inside the
/// guest's shared memory. `size` is the capacity of the region in bytes;
/// `buffer` is the guest-visible pointer to its first byte.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct SizedBuffer {
    pub size: u64,
    pub buffer: *mut c_void,
}

/// Buffer the guest uses to describe the host functions it may call.
pub type HostFunctionDefinitions = SizedBuffer;
/// Buffer the host uses to report a native exception raised while
/// servicing an `outb` request from the guest.
pub type HostExceptionData = SizedBuffer;
/// Buffer the guest uses to report a fatal error back to the host.
pub type GuestErrorData = SizedBuffer;
/// Buffer used for host-to-guest function call input.
pub type InputData = SizedBuffer;
/// Buffer used for guest-to-host function call output.
pub type OutputData = SizedBuffer;
/// Buffer the guest uses to describe the context of a panic.
pub type GuestPanicContextData = SizedBuffer;
/// Buffer backing the guest's heap allocator.
pub type GuestHeapData = SizedBuffer;
/// Buffer backing the guest's stack.
pub type GuestStackData = SizedBuffer;

/// The process environment block: the single struct the host writes into
/// guest memory before the first run, and the guest entry point reads to
/// find everything else. Its address is passed to the guest in a general
/// purpose register at start-of-day.
///
/// Field order matters: it is part of the wire contract and must not be
/// changed without also changing every offset computed against it in the
/// host's memory layout code.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct SandboxPEB {
    /// Random seed the guest uses to derive its stack-protector cookie.
    pub security_cookie_seed: u64,
    /// Pointer to the guest's dispatch function, filled in by the guest
    /// itself during its entry sequence.
    pub guest_function_dispatch_ptr: u64,
    pub host_function_definitions: HostFunctionDefinitions,
    pub host_exception_data: HostExceptionData,
    pub guest_error_data: GuestErrorData,
    /// Pointer to the loaded guest code.
    pub code_ptr: *mut c_void,
    /// Pointer the guest calls to trigger an `outb`-style host request in
    /// in-process execution mode.
    pub outb_ptr: *mut c_void,
    pub outb_context_ptr: *mut c_void,
    pub input_data: InputData,
    pub output_data: OutputData,
    pub guest_panic_context_data: GuestPanicContextData,
    pub guest_heap_data: GuestHeapData,
    pub guest_stack_data: GuestStackData,
}
