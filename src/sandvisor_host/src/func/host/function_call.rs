use crate::func::function_call::{ReadFunctionCallFromMemory, WriteFunctionCallToMemory};
use crate::mem::layout::SandboxMemoryLayout;
use crate::mem::shared_mem::SharedMemory;
use crate::new_error;
use crate::Result;

/// A host function call is a function call from the guest to the host,
/// made while the guest is servicing a `GuestFunctionCall`.
///
/// It shares the input data region with `GuestFunctionCall`: by the time
/// the guest issues one of these, the original call it's servicing has
/// already been read out of that region.
#[derive(Default)]
pub(crate) struct HostFunctionCall {}

impl WriteFunctionCallToMemory for HostFunctionCall {
    fn write(
        &self,
        function_call_buffer: &[u8],
        shared_memory: &mut SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<()> {
        let input_size_offset = usize::try_from(layout.get_input_data_size_offset())?;
        let buffer_size = usize::try_from(shared_memory.read_u64(input_size_offset)?)?;

        if function_call_buffer.len() > buffer_size {
            return Err(new_error!(
                "host function call buffer of {} bytes is too big for the {}-byte input data buffer",
                function_call_buffer.len(),
                buffer_size
            ));
        }

        shared_memory.copy_from_slice(
            function_call_buffer,
            usize::try_from(layout.input_data_buffer_offset)?,
        )
    }
}

impl ReadFunctionCallFromMemory for HostFunctionCall {
    fn read(&self, shared_memory: &SharedMemory, layout: &SandboxMemoryLayout) -> Result<Vec<u8>> {
        let input_data_offset = usize::try_from(layout.input_data_buffer_offset)?;
        let total_len = usize::try_from(shared_memory.read_u32(input_data_offset)?)?;

        let mut function_call_buffer = vec![0; 4 + total_len];
        shared_memory.copy_to_slice(&mut function_call_buffer, input_data_offset)?;

        Ok(function_call_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::function_call::FunctionCall;
    use crate::func::types::ParameterValue;
    use crate::sandbox::SandboxConfiguration;

    #[test]
    fn write_then_read() {
        let call = FunctionCall::new(
            "HostPrint".to_string(),
            vec![ParameterValue::String("hi".to_string())],
        );
        let buffer = Vec::<u8>::try_from(&call).unwrap();

        let memory_config = SandboxConfiguration::default();
        let memory_layout = SandboxMemoryLayout::new(memory_config, 4096, 4096, 4096).unwrap();
        let mem_size = memory_layout.get_memory_size().unwrap();
        let mut shared_memory = SharedMemory::new(mem_size).unwrap();
        let offset = shared_memory.base_addr();
        memory_layout.write(&mut shared_memory, offset, mem_size).unwrap();

        let host_function_call = HostFunctionCall {};
        host_function_call
            .write(&buffer, &mut shared_memory, &memory_layout)
            .unwrap();
        let read_back = host_function_call.read(&shared_memory, &memory_layout).unwrap();
        let decoded = FunctionCall::try_from(read_back.as_slice()).unwrap();
        assert_eq!(decoded.function_name, "HostPrint");
    }
}
