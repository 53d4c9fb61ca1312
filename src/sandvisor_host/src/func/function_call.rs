use crate::func::types::ParameterValue;
use crate::mem::layout::SandboxMemoryLayout;
use crate::mem::shared_mem::SharedMemory;
use crate::Result;

/// A call to a function, either host-to-guest or guest-to-host: a name and
/// an ordered list of arguments.
///
/// Wire layout: `[u32 total_len][name: len-prefixed utf8][u32 param_count]`
/// followed by `param_count` tagged, length-prefixed `ParameterValue`
/// encodings (see `func::types`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub(crate) function_name: String,
    pub(crate) parameters: Vec<ParameterValue>,
}

impl FunctionCall {
    pub(crate) fn new(function_name: String, parameters: Vec<ParameterValue>) -> Self {
        Self {
            function_name,
            parameters,
        }
    }
}

impl TryFrom<&FunctionCall> for Vec<u8> {
    type Error = crate::error::SandboxError;
    fn try_from(value: &FunctionCall) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let name_bytes = value.function_name.as_bytes();
        body.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(name_bytes);
        body.extend_from_slice(&(value.parameters.len() as u32).to_le_bytes());
        for param in &value.parameters {
            let encoded = Vec::<u8>::try_from(param)?;
            body.extend_from_slice(&encoded);
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl TryFrom<&[u8]> for FunctionCall {
    type Error = crate::error::SandboxError;
    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 8 {
            return Err(crate::new_error!("function call buffer is too short"));
        }
        let total_len = u32::from_le_bytes(value[0..4].try_into()?) as usize;
        if value.len() < 4 + total_len {
            return Err(crate::new_error!(
                "function call buffer declares length {} but only {} bytes are available",
                total_len,
                value.len().saturating_sub(4)
            ));
        }
        let body = &value[4..4 + total_len];
        let name_len = u32::from_le_bytes(body[0..4].try_into()?) as usize;
        let mut cursor = 4 + name_len;
        let function_name = String::from_utf8_lossy(&body[4..cursor]).into_owned();
        let param_count = u32::from_le_bytes(body[cursor..cursor + 4].try_into()?) as usize;
        cursor += 4;
        let mut parameters = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let remaining = &body[cursor..];
            let param_total_len =
                u32::from_le_bytes(remaining.get(0..4).ok_or_else(|| {
                    crate::new_error!("function call buffer truncated mid-parameter")
                })?.try_into()?) as usize;
            let param_bytes = &remaining[..4 + param_total_len];
            parameters.push(ParameterValue::try_from(param_bytes)?);
            cursor += 4 + param_total_len;
        }
        Ok(FunctionCall {
            function_name,
            parameters,
        })
    }
}

/// Write an encoded function call buffer into the region of `shared_memory`
/// that `layout` describes.
pub(crate) trait WriteFunctionCallToMemory {
    fn write(
        &self,
        function_call_buffer: &[u8],
        shared_memory: &mut SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<()>;
}

/// Read an encoded function call buffer back out of shared memory.
pub(crate) trait ReadFunctionCallFromMemory {
    fn read(&self, shared_memory: &SharedMemory, layout: &SandboxMemoryLayout) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let call = FunctionCall::new(
            "PrintMessage".to_string(),
            vec![ParameterValue::String("hi".to_string()), ParameterValue::Int(7)],
        );
        let bytes = Vec::<u8>::try_from(&call).unwrap();
        let decoded = FunctionCall::try_from(bytes.as_slice()).unwrap();
        assert_eq!(call, decoded);
    }
}
