use std::ffi::NulError;
use std::num::TryFromIntError;

use thiserror::Error;

/// All errors that can occur while creating, running, or tearing down a
/// sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The guest binary is not a PE32+ (x64) executable image, or fails one
    /// of the structural checks `PEInfo::new` performs on it.
    #[error("Malformed or unsupported guest PE image: {0}")]
    InvalidGuestBinary(String),

    /// A base relocation entry used a relocation type other than
    /// `IMAGE_REL_BASED_DIR64`/`IMAGE_REL_BASED_ABSOLUTE`.
    #[error("Unsupported PE relocation type {0}")]
    UnsupportedRelocationType(u16),

    /// The computed size of a sandbox's guest memory region exceeded the
    /// largest size this crate's page tables can describe.
    #[error("Memory request of size {0} exceeds the maximum sandbox memory size {1}")]
    MemoryRequestTooBig(usize, usize),

    /// A read or write against `SharedMemory` fell outside its bounds.
    #[error("Offset {0} with size {1} is out of bounds for memory of size {2}")]
    BoundsCheckFailed(usize, usize, usize),

    /// `mmap(2)` failed while allocating a sandbox's guest memory.
    #[error("mmap failed with OS error {0:?}")]
    MmapFailed(Option<i32>),

    /// `mprotect(2)` failed while guarding a sandbox's guest memory.
    #[error("mprotect failed with OS error {0:?}")]
    MprotectFailed(Option<i32>),

    /// Platform memory allocation (e.g. `VirtualAlloc`) failed.
    #[error("memory allocation failed with OS error {0:?}")]
    MemoryAllocationFailed(Option<i32>),

    /// A `guest_offset` passed to `SandboxMemoryLayout::write` did not match
    /// either the in-hypervisor base address or `shared_mem`'s base address.
    #[error("guest offset {0} is not a valid base address for this layout")]
    GuestOffsetIsInvalid(usize),

    /// No hypervisor capable of running this sandbox was found on the host.
    #[error("no supported hypervisor is available on this host")]
    NoHypervisorFound,

    /// The requested `SandboxRunOptions` combination is not supported on
    /// this platform.
    #[error("unsupported platform configuration: {0}")]
    UnsupportedPlatform(String),

    /// The guest ran for longer than `max_execution_time` and was forcibly
    /// cancelled.
    #[error("guest execution exceeded the configured maximum execution time")]
    ExecutionCanceledByHost,

    /// The host requested cancellation, but the vCPU thread did not
    /// acknowledge it within `max_wait_for_cancellation`.
    #[error("timed out waiting for guest execution to be cancelled")]
    CancellationTimeout,

    /// A previous call left the sandbox's vCPU thread in an indeterminate
    /// state; it can no longer be used.
    #[error("sandbox is poisoned by a previous unrecovered error and cannot be reused")]
    SandboxPoisoned,

    /// A call was attempted while `ReentrancyState` already reflected an
    /// in-flight call on this sandbox.
    #[error("a guest call is already in progress on this sandbox")]
    AlreadyInProgress,

    /// A second call was made against a sandbox created with
    /// `SandboxRunOptions::None`, which only supports a single call.
    #[error("sandbox is not configured to be reused; create it with RecycleAfterRun")]
    NotRecyclable,

    /// The guest's stack guard bytes were overwritten, indicating the
    /// guest corrupted memory below its stack.
    #[error("guest call overflowed its stack")]
    StackOverflow,

    /// The host observed and re-raised an exception the guest reported
    /// while servicing a host function call.
    #[error("host function call raised an exception: {0:?}")]
    HostException(Vec<u8>),

    /// The guest explicitly aborted via the `Abort` outb action.
    #[error("guest aborted with code {0}")]
    GuestAborted(u8),

    /// The guest reported a fatal error of its own via `GuestError`.
    #[error("guest reported error {0:?}: {1}")]
    GuestError(crate::func::guest::error::ErrorCode, String),

    /// The guest executed an `outb` with a port number this crate does not
    /// recognize.
    #[error("unknown outb port {0}")]
    UnknownOutBPort(u16),

    /// A host function call named a function that was never registered
    /// with `expose_host_function`.
    #[error("host function {0} was not found")]
    HostFunctionNotFound(String),

    /// A call, whether host-to-guest or guest-to-host, supplied arguments
    /// whose types did not match the callee's declared signature.
    #[error("call to {0} had parameter type mismatch: expected {1}, got {2}")]
    ParameterTypeMismatch(String, String, String),

    /// A call expected a return value of one type, but got another.
    #[error("expected return type {0}, got {1}")]
    ReturnTypeMismatch(String, String),

    /// Generic catch-all error, used when no more specific variant applies.
    #[error("{0}")]
    Error(String),

    /// A `TryFrom<usize>`/`TryFrom<u64>` conversion between address types
    /// overflowed.
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),

    #[error(transparent)]
    NulError(#[from] NulError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Kvm(#[from] kvm_ioctls::Error),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Mshv(#[from] mshv_ioctls::MshvError),

    #[cfg(target_os = "windows")]
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Construct a `SandboxError::Error` from a format string, the same way
/// `anyhow!` builds an ad hoc error.
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {
        $crate::error::SandboxError::Error(format!($msg))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::SandboxError::Error(format!($fmt, $($arg)*))
    };
}

/// Log a constructed error at `error` level, then return it from the
/// enclosing function via `?`-compatible `Err(...)`.
#[macro_export]
macro_rules! log_then_return {
    ($err:expr) => {{
        let err = $crate::error::SandboxError::from($err);
        tracing::error!(error = %err, "returning error");
        return Err(err);
    }};
}
