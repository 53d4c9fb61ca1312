use crate::func::function_call::{ReadFunctionCallFromMemory, WriteFunctionCallToMemory};
use crate::mem::layout::SandboxMemoryLayout;
use crate::mem::shared_mem::SharedMemory;
use crate::new_error;
use crate::Result;

/// A guest function call is a function call from the host to the guest.
#[derive(Default)]
pub(crate) struct GuestFunctionCall {}

impl WriteFunctionCallToMemory for GuestFunctionCall {
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
                "guest function call buffer of {} bytes is too big for the {}-byte input data buffer",
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

impl ReadFunctionCallFromMemory for GuestFunctionCall {
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
    use crate::Result;

    fn test_data() -> Vec<u8> {
        let call = FunctionCall::new(
            "PrintMessage".to_string(),
            vec![ParameterValue::String("hello".to_string())],
        );
        Vec::<u8>::try_from(&call).unwrap()
    }

    #[test]
    fn write_to_memory() -> Result<()> {
        let test_buffer = test_data();
        let guest_function_call = GuestFunctionCall {};
        let memory_config = SandboxConfiguration::default();
        let mut shared_memory = SharedMemory::new(32768)?;
        let memory_layout = SandboxMemoryLayout::new(memory_config, 4096, 4096, 4096)?;
        let result = guest_function_call.write(&test_buffer, &mut shared_memory, &memory_layout);
        assert!(result.is_err());

        let memory_config = SandboxConfiguration::default();
        let memory_layout = SandboxMemoryLayout::new(memory_config, 4096, 4096, 4096)?;
        let mem_size = memory_layout.get_memory_size()?;
        let mut shared_memory = SharedMemory::new(mem_size)?;
        let offset = shared_memory.base_addr();
        memory_layout.write(&mut shared_memory, offset, mem_size)?;

        let result = guest_function_call.write(&test_buffer, &mut shared_memory, &memory_layout);
        assert!(result.is_ok());

        let read_back = guest_function_call.read(&shared_memory, &memory_layout)?;
        let decoded = FunctionCall::try_from(read_back.as_slice())?;
        assert_eq!(decoded.function_name, "PrintMessage");

        Ok(())
    }
}
