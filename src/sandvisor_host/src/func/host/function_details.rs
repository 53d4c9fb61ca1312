use crate::error::SandboxError;
use crate::func::host::function_definition::HostFunctionDefinition;
use crate::mem::layout::SandboxMemoryLayout;
use crate::mem::shared_mem::SharedMemory;
use crate::Result;

/// The set of functions the host has exposed to the guest, sorted by name
/// so the guest can binary-search them.
///
/// Wire layout: `[u32 total_len][u32 count]` followed by `count`
/// length-prefixed `HostFunctionDefinition` encodings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HostFunctionDetails {
    pub(crate) host_functions: Vec<HostFunctionDefinition>,
}

impl HostFunctionDetails {
    pub(crate) fn insert_host_function(&mut self, definition: HostFunctionDefinition) {
        self.host_functions
            .retain(|existing| existing.function_name != definition.function_name);
        self.host_functions.push(definition);
    }

    pub(crate) fn sort_host_functions_by_name(&mut self) {
        self.host_functions.sort();
    }

    pub(crate) fn write_to_memory(
        &self,
        shared_mem: &mut SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<()> {
        let buffer: Vec<u8> = self.try_into()?;
        shared_mem.copy_from_slice(
            buffer.as_slice(),
            usize::try_from(layout.host_function_definitions_buffer_offset)?,
        )
    }
}

impl TryFrom<&HostFunctionDetails> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: &HostFunctionDetails) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&(value.host_functions.len() as u32).to_le_bytes());
        for def in &value.host_functions {
            let encoded = Vec::<u8>::try_from(def)?;
            body.extend_from_slice(&encoded);
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl TryFrom<&[u8]> for HostFunctionDetails {
    type Error = SandboxError;
    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 8 {
            return Err(crate::new_error!("host function details buffer is too short"));
        }
        let total_len = u32::from_le_bytes(value[0..4].try_into()?) as usize;
        if value.len() < 4 + total_len {
            return Err(crate::new_error!(
                "host function details buffer declares length {} but only {} bytes are available",
                total_len,
                value.len().saturating_sub(4)
            ));
        }
        let body = &value[4..4 + total_len];
        let count = u32::from_le_bytes(body[0..4].try_into()?) as usize;
        let mut cursor = 4;
        let mut host_functions = Vec::with_capacity(count);
        for _ in 0..count {
            let remaining = &body[cursor..];
            let def_total_len = u32::from_le_bytes(
                remaining
                    .get(0..4)
                    .ok_or_else(|| crate::new_error!("host function details buffer truncated"))?
                    .try_into()?,
            ) as usize;
            let def_bytes = &remaining[..4 + def_total_len];
            host_functions.push(HostFunctionDefinition::try_from(def_bytes)?);
            cursor += 4 + def_total_len;
        }
        Ok(HostFunctionDetails { host_functions })
    }
}

impl TryFrom<(&SharedMemory, &SandboxMemoryLayout)> for HostFunctionDetails {
    type Error = SandboxError;
    fn try_from(value: (&SharedMemory, &SandboxMemoryLayout)) -> Result<Self> {
        let (shared_mem, layout) = value;
        let offset = usize::try_from(layout.host_function_definitions_buffer_offset)?;
        let total_len = usize::try_from(shared_mem.read_u32(offset)?)?;
        let mut buffer = vec![0u8; 4 + total_len];
        shared_mem.copy_to_slice(buffer.as_mut_slice(), offset)?;
        HostFunctionDetails::try_from(buffer.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::types::{ParameterType, ReturnType};

    #[test]
    fn round_trip() {
        let mut details = HostFunctionDetails::default();
        details.insert_host_function(HostFunctionDefinition::new(
            "HostPrint".to_string(),
            Some(vec![ParameterType::String]),
            ReturnType::Int,
        ));
        details.insert_host_function(HostFunctionDefinition::new(
            "GetConstant".to_string(),
            None,
            ReturnType::Long,
        ));
        details.sort_host_functions_by_name();

        let bytes = Vec::<u8>::try_from(&details).unwrap();
        let decoded = HostFunctionDetails::try_from(bytes.as_slice()).unwrap();
        assert_eq!(details, decoded);
        assert_eq!(decoded.host_functions[0].function_name, "GetConstant");
    }

    #[test]
    fn insert_replaces_existing_by_name() {
        let mut details = HostFunctionDetails::default();
        details.insert_host_function(HostFunctionDefinition::new(
            "Foo".to_string(),
            None,
            ReturnType::Int,
        ));
        details.insert_host_function(HostFunctionDefinition::new(
            "Foo".to_string(),
            None,
            ReturnType::Long,
        ));
        assert_eq!(details.host_functions.len(), 1);
        assert_eq!(details.host_functions[0].return_type, ReturnType::Long);
    }
}
