use super::log_level::LogLevel;
use crate::error::SandboxError;
use crate::mem::{layout::SandboxMemoryLayout, shared_mem::SharedMemory};
use crate::Result;

/// A single log record emitted by the guest while servicing a call.
#[derive(Eq, PartialEq, Debug, Clone)]
#[allow(missing_docs)]
pub struct GuestLogData {
    pub message: String,
    pub source: String,
    pub level: LogLevel,
    pub caller: String,
    pub source_file: String,
    pub line: u32,
}

impl GuestLogData {
    #[cfg(test)]
    pub(crate) fn new(
        message: String,
        source: String,
        level: LogLevel,
        caller: String,
        source_file: String,
        line: u32,
    ) -> Self {
        Self {
            message,
            source,
            level,
            caller,
            source_file,
            line,
        }
    }

    /// Write `self` to the output data region of `shared_mem`.
    ///
    /// This is only ever exercised from test code: in production the
    /// guest, not the host, is the one writing log records.
    #[cfg(test)]
    pub(crate) fn write_to_memory(
        &self,
        shared_mem: &mut SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<()> {
        let guest_log_data_buffer: Vec<u8> = self.try_into()?;
        shared_mem.copy_from_slice(
            guest_log_data_buffer.as_slice(),
            usize::try_from(layout.get_output_data_offset())?,
        )
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_str<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a str> {
    let len = u32::from_le_bytes(
        buf.get(*cursor..*cursor + 4)
            .ok_or_else(|| crate::new_error!("guest log data buffer truncated"))?
            .try_into()?,
    ) as usize;
    *cursor += 4;
    let s = buf
        .get(*cursor..*cursor + len)
        .ok_or_else(|| crate::new_error!("guest log data buffer truncated"))?;
    *cursor += len;
    Ok(std::str::from_utf8(s).unwrap_or(""))
}

impl TryFrom<Vec<u8>> for GuestLogData {
    type Error = SandboxError;
    fn try_from(raw_vec: Vec<u8>) -> Result<Self> {
        Self::try_from(raw_vec.as_slice())
    }
}

impl TryFrom<&[u8]> for GuestLogData {
    type Error = SandboxError;
    fn try_from(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < 9 {
            return Err(crate::new_error!("guest log data buffer is too short"));
        }
        let total_len = u32::from_le_bytes(raw_bytes[0..4].try_into()?) as usize;
        if raw_bytes.len() < 4 + total_len {
            return Err(crate::new_error!(
                "guest log data buffer declares length {} but only {} bytes are available",
                total_len,
                raw_bytes.len().saturating_sub(4)
            ));
        }
        let body = &raw_bytes[4..4 + total_len];
        let level = LogLevel::try_from(*body.first().ok_or_else(|| {
            crate::new_error!("guest log data buffer is missing its level byte")
        })?)?;
        let line = u32::from_le_bytes(body[1..5].try_into()?);
        let mut cursor = 5usize;
        let message = read_str(body, &mut cursor)?.to_string();
        let source = read_str(body, &mut cursor)?.to_string();
        let caller = read_str(body, &mut cursor)?.to_string();
        let source_file = read_str(body, &mut cursor)?.to_string();

        Ok(GuestLogData {
            message,
            source,
            level,
            caller,
            source_file,
            line,
        })
    }
}

impl TryFrom<(&SharedMemory, SandboxMemoryLayout)> for GuestLogData {
    type Error = SandboxError;
    fn try_from(value: (&SharedMemory, SandboxMemoryLayout)) -> Result<Self> {
        let (shared_mem, layout) = value;
        let offset = usize::try_from(layout.get_output_data_offset())?;
        let size = shared_mem.read_u32(offset)?;
        let len_usize = usize::try_from(size)? + std::mem::size_of::<u32>();
        let mut vec_out = vec![0; len_usize];
        shared_mem.copy_to_slice(vec_out.as_mut_slice(), offset)?;
        GuestLogData::try_from(vec_out.as_slice())
    }
}

impl TryFrom<&GuestLogData> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: &GuestLogData) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.push(u8::from(value.level));
        body.extend_from_slice(&value.line.to_le_bytes());
        write_str(&mut body, &value.message);
        write_str(&mut body, &value.source);
        write_str(&mut body, &value.caller);
        write_str(&mut body, &value.source_file);

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl TryFrom<GuestLogData> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: GuestLogData) -> Result<Vec<u8>> {
        (&value).try_into()
    }
}

#[cfg(test)]
mod test {
    use super::GuestLogData;
    use crate::{
        func::guest::log_level::LogLevel,
        mem::{layout::SandboxMemoryLayout, shared_mem::SharedMemory},
        sandbox::SandboxConfiguration,
    };

    #[test]
    fn round_trip() {
        let gld = GuestLogData {
            message: "test message".to_string(),
            source: "test source".to_string(),
            caller: "test caller".to_string(),
            source_file: "test source file".to_string(),
            line: 123,
            level: LogLevel::Critical,
        };
        let decoded = {
            let layout =
                SandboxMemoryLayout::new(SandboxConfiguration::default(), 12, 12, 12).unwrap();
            let mut shared_mem = SharedMemory::new(layout.get_memory_size().unwrap()).unwrap();
            gld.write_to_memory(&mut shared_mem, &layout).unwrap();
            GuestLogData::try_from((&shared_mem, layout)).unwrap()
        };
        assert_eq!(gld, decoded);
    }
}
