use crate::error::SandboxError;
use crate::mem::layout::SandboxMemoryLayout;
use crate::mem::shared_mem::SharedMemory;
use crate::Result;

/// The error code a guest reports when it cannot continue a call.
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ErrorCode {
    #[default]
    NoError = 0,
    UnsupportedParameterType = 1,
    GuestFunctionNotFound = 2,
    GuestFunctionParameterTypeMismatch = 3,
    GuestFunctionIncorrectNumberOfParameters = 4,
    GsCheckFailed = 5,
    StackOverflow = 6,
    GuestHeapAllocationFailed = 7,
    OutbError = 8,
    ManualGuestPanic = 9,
}

impl TryFrom<u16> for ErrorCode {
    type Error = SandboxError;
    fn try_from(val: u16) -> Result<Self> {
        match val {
            0 => Ok(ErrorCode::NoError),
            1 => Ok(ErrorCode::UnsupportedParameterType),
            2 => Ok(ErrorCode::GuestFunctionNotFound),
            3 => Ok(ErrorCode::GuestFunctionParameterTypeMismatch),
            4 => Ok(ErrorCode::GuestFunctionIncorrectNumberOfParameters),
            5 => Ok(ErrorCode::GsCheckFailed),
            6 => Ok(ErrorCode::StackOverflow),
            7 => Ok(ErrorCode::GuestHeapAllocationFailed),
            8 => Ok(ErrorCode::OutbError),
            9 => Ok(ErrorCode::ManualGuestPanic),
            other => Err(crate::new_error!("unknown guest error code {}", other)),
        }
    }
}

/// The error code of a `GuestError`.
pub type Code = ErrorCode;

/// A fatal error the guest reported back to the host.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GuestError {
    /// The error code.
    pub code: Code,
    /// The error message.
    pub message: String,
}

impl GuestError {
    /// Create a new `GuestError`.
    pub fn new(code: Code, message: String) -> Self {
        Self { code, message }
    }

    fn get_memory_buffer_max_size(
        guest_mem: &SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<u64> {
        let err_buffer_size_offset = usize::try_from(layout.get_guest_error_buffer_size_offset())?;
        guest_mem.read_u64(err_buffer_size_offset)
    }

    /// Write the guest error to the shared memory.
    pub fn write_to_memory(
        self,
        guest_mem: &mut SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<()> {
        let guest_error_buffer: Vec<u8> = (&self).try_into()?;
        let max_error_buffer_size = Self::get_memory_buffer_max_size(guest_mem, layout)?;
        if guest_error_buffer.len() as u64 > max_error_buffer_size {
            return Err(crate::new_error!(
                "guest error message of {} bytes does not fit in the {}-byte guest error buffer",
                guest_error_buffer.len(),
                max_error_buffer_size
            ));
        }
        guest_mem.copy_from_slice(
            guest_error_buffer.as_slice(),
            usize::try_from(layout.guest_error_buffer_offset)?,
        )
    }
}

impl TryFrom<(&SharedMemory, &SandboxMemoryLayout)> for GuestError {
    type Error = SandboxError;
    fn try_from(value: (&SharedMemory, &SandboxMemoryLayout)) -> Result<Self> {
        let max_err_buffer_size = Self::get_memory_buffer_max_size(value.0, value.1)?;
        let mut guest_error_buffer = vec![0u8; usize::try_from(max_err_buffer_size)?];
        let err_msg_offset = usize::try_from(value.1.guest_error_buffer_offset)?;
        value
            .0
            .copy_to_slice(guest_error_buffer.as_mut_slice(), err_msg_offset)?;
        GuestError::try_from(guest_error_buffer.as_slice())
    }
}

impl TryFrom<&[u8]> for GuestError {
    type Error = SandboxError;
    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 8 {
            return Err(crate::new_error!(
                "guest error buffer of {} bytes is too short to contain a header",
                value.len()
            ));
        }
        let total_len = u32::from_le_bytes(value[0..4].try_into()?) as usize;
        if value.len() < 4 + total_len || total_len < 6 {
            return Err(crate::new_error!(
                "guest error buffer declares length {} but only {} bytes are available",
                total_len,
                value.len().saturating_sub(4)
            ));
        }
        let code = Code::try_from(u16::from_le_bytes(value[4..6].try_into()?))?;
        let msg_len = u32::from_le_bytes(value[6..10].try_into()?) as usize;
        let message = String::from_utf8_lossy(&value[10..10 + msg_len]).into_owned();
        Ok(Self { code, message })
    }
}

impl TryFrom<&GuestError> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: &GuestError) -> Result<Vec<u8>> {
        let msg_bytes = value.message.as_bytes();
        // total_len covers everything after the length prefix: the 2-byte
        // code, the 4-byte message length, and the message bytes.
        let total_len = 2 + 4 + msg_bytes.len();
        let mut out = Vec::with_capacity(4 + total_len);
        out.extend_from_slice(&(total_len as u32).to_le_bytes());
        out.extend_from_slice(&(value.code as u16).to_le_bytes());
        out.extend_from_slice(&(msg_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(msg_bytes);
        Ok(out)
    }
}

impl TryFrom<GuestError> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: GuestError) -> Result<Vec<u8>> {
        (&value).try_into()
    }
}

impl Default for GuestError {
    fn default() -> Self {
        Self {
            code: Code::NoError,
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let err = GuestError::new(ErrorCode::GuestFunctionNotFound, "no such function".into());
        let bytes: Vec<u8> = (&err).try_into().unwrap();
        let decoded = GuestError::try_from(bytes.as_slice()).unwrap();
        assert_eq!(err, decoded);
    }
}
