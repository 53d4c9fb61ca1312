use std::cmp::max;
use std::time::Duration;

use crate::mem::pe::pe_info::PEInfo;

/// Every size and timing knob needed to lay out and run a sandbox.
///
/// Field widths (`u16` milliseconds, `u8` milliseconds) are kept narrow
/// deliberately: this struct is copied wholesale into `SandboxMemoryLayout`
/// calculations on every sandbox creation, and its cancellation fields are
/// read from a watchdog thread without synchronization beyond `Copy`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct SandboxConfiguration {
    guest_error_buffer_size: usize,
    host_function_definition_size: usize,
    host_exception_size: usize,
    input_data_size: usize,
    output_data_size: usize,
    guest_panic_context_buffer_size: usize,
    /// Overrides the stack size declared in the guest PE header. Zero means
    /// "use the PE header's value".
    stack_size_override: u64,
    /// Overrides the heap size declared in the guest PE header. Zero means
    /// "use the PE header's value".
    heap_size_override: u64,
    /// Wall-clock budget, in milliseconds, for a single guest call.
    max_execution_time_ms: u16,
    /// How long, in milliseconds, the host waits for a cancelled vCPU
    /// thread to acknowledge before declaring the sandbox poisoned.
    max_wait_for_cancellation_ms: u8,
}

impl SandboxConfiguration {
    const DEFAULT_INPUT_SIZE: usize = 0x4000;
    const MIN_INPUT_SIZE: usize = 0x2000;
    const DEFAULT_OUTPUT_SIZE: usize = 0x4000;
    const MIN_OUTPUT_SIZE: usize = 0x2000;
    const DEFAULT_HOST_FUNCTION_DEFINITION_SIZE: usize = 0x1000;
    const MIN_HOST_FUNCTION_DEFINITION_SIZE: usize = 0x400;
    const DEFAULT_HOST_EXCEPTION_SIZE: usize = 0x4000;
    const MIN_HOST_EXCEPTION_SIZE: usize = 0x4000;
    const DEFAULT_GUEST_ERROR_BUFFER_SIZE: usize = 0x100;
    const MIN_GUEST_ERROR_BUFFER_SIZE: usize = 0x80;
    const DEFAULT_GUEST_PANIC_CONTEXT_SIZE: usize = 0x400;
    pub(crate) const DEFAULT_MAX_EXECUTION_TIME_MS: u16 = 1000;
    const MIN_MAX_EXECUTION_TIME_MS: u16 = 1;
    const DEFAULT_MAX_WAIT_FOR_CANCELLATION_MS: u8 = 100;
    const MIN_MAX_WAIT_FOR_CANCELLATION_MS: u8 = 10;

    /// Build a new configuration, clamping every bound up to its required
    /// minimum and falling back to defaults for anything out of range.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_data_size: usize,
        output_data_size: usize,
        function_definition_size: usize,
        host_exception_size: usize,
        guest_error_buffer_size: usize,
        stack_size_override: Option<u64>,
        heap_size_override: Option<u64>,
        max_execution_time: Option<Duration>,
        max_wait_for_cancellation: Option<Duration>,
    ) -> Self {
        Self {
            input_data_size: max(input_data_size, Self::MIN_INPUT_SIZE),
            output_data_size: max(output_data_size, Self::MIN_OUTPUT_SIZE),
            host_function_definition_size: max(
                function_definition_size,
                Self::MIN_HOST_FUNCTION_DEFINITION_SIZE,
            ),
            host_exception_size: max(host_exception_size, Self::MIN_HOST_EXCEPTION_SIZE),
            guest_error_buffer_size: max(
                guest_error_buffer_size,
                Self::MIN_GUEST_ERROR_BUFFER_SIZE,
            ),
            guest_panic_context_buffer_size: Self::DEFAULT_GUEST_PANIC_CONTEXT_SIZE,
            stack_size_override: stack_size_override.unwrap_or(0),
            heap_size_override: heap_size_override.unwrap_or(0),
            max_execution_time_ms: match max_execution_time {
                Some(d) => match d.as_millis() {
                    0 => Self::DEFAULT_MAX_EXECUTION_TIME_MS,
                    1..=65_535u128 => {
                        max(d.as_millis(), Self::MIN_MAX_EXECUTION_TIME_MS.into()) as u16
                    }
                    _ => Self::DEFAULT_MAX_EXECUTION_TIME_MS,
                },
                None => Self::DEFAULT_MAX_EXECUTION_TIME_MS,
            },
            max_wait_for_cancellation_ms: match max_wait_for_cancellation {
                Some(d) => match d.as_millis() {
                    0 => Self::DEFAULT_MAX_WAIT_FOR_CANCELLATION_MS,
                    1..=255u128 => {
                        max(d.as_millis(), Self::MIN_MAX_WAIT_FOR_CANCELLATION_MS.into()) as u8
                    }
                    _ => Self::DEFAULT_MAX_WAIT_FOR_CANCELLATION_MS,
                },
                None => Self::DEFAULT_MAX_WAIT_FOR_CANCELLATION_MS,
            },
        }
    }

    fn stack_size_override_opt(&self) -> Option<u64> {
        (self.stack_size_override > 0).then_some(self.stack_size_override)
    }

    fn heap_size_override_opt(&self) -> Option<u64> {
        (self.heap_size_override > 0).then_some(self.heap_size_override)
    }

    /// If `stack_size_override` is non-zero, return it. Otherwise return
    /// `pe_info.stack_reserve()`.
    pub(crate) fn get_stack_size(&self, pe_info: &PEInfo) -> u64 {
        self.stack_size_override_opt()
            .unwrap_or_else(|| pe_info.stack_reserve())
    }

    /// If `heap_size_override` is non-zero, return it. Otherwise return
    /// `pe_info.heap_reserve()`.
    pub(crate) fn get_heap_size(&self, pe_info: &PEInfo) -> u64 {
        self.heap_size_override_opt()
            .unwrap_or_else(|| pe_info.heap_reserve())
    }

    pub(crate) fn get_host_function_definition_size(&self) -> usize {
        self.host_function_definition_size
    }

    pub(crate) fn get_host_exception_size(&self) -> usize {
        self.host_exception_size
    }

    pub(crate) fn get_guest_error_buffer_size(&self) -> usize {
        self.guest_error_buffer_size
    }

    pub(crate) fn get_input_data_size(&self) -> usize {
        self.input_data_size
    }

    pub(crate) fn get_output_data_size(&self) -> usize {
        self.output_data_size
    }

    pub(crate) fn get_guest_panic_context_buffer_size(&self) -> usize {
        self.guest_panic_context_buffer_size
    }

    pub(crate) fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms as u64)
    }

    pub(crate) fn max_wait_for_cancellation(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_cancellation_ms as u64)
    }
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_INPUT_SIZE,
            Self::DEFAULT_OUTPUT_SIZE,
            Self::DEFAULT_HOST_FUNCTION_DEFINITION_SIZE,
            Self::DEFAULT_HOST_EXCEPTION_SIZE,
            Self::DEFAULT_GUEST_ERROR_BUFFER_SIZE,
            None,
            None,
            None,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::SandboxConfiguration;

    #[test]
    fn clamps_to_minimums() {
        let cfg = SandboxConfiguration::new(0, 0, 0, 0, 0, None, None, None, None);
        assert_eq!(cfg.get_input_data_size(), SandboxConfiguration::MIN_INPUT_SIZE);
        assert_eq!(cfg.get_output_data_size(), SandboxConfiguration::MIN_OUTPUT_SIZE);
        assert_eq!(
            cfg.get_host_function_definition_size(),
            SandboxConfiguration::MIN_HOST_FUNCTION_DEFINITION_SIZE
        );
        assert_eq!(cfg.get_host_exception_size(), SandboxConfiguration::MIN_HOST_EXCEPTION_SIZE);
        assert_eq!(
            cfg.get_guest_error_buffer_size(),
            SandboxConfiguration::MIN_GUEST_ERROR_BUFFER_SIZE
        );
    }

    #[test]
    fn overrides_round_trip() {
        let cfg = SandboxConfiguration::new(
            0x4000,
            0x4001,
            0x4002,
            0x4003,
            0x40004,
            Some(0x10000),
            Some(0x50000),
            Some(Duration::from_millis(1010)),
            Some(Duration::from_millis(200)),
        );
        assert_eq!(cfg.max_execution_time(), Duration::from_millis(1010));
        assert_eq!(cfg.max_wait_for_cancellation(), Duration::from_millis(200));
        assert_eq!(cfg.output_data_size, 0x4001);
    }

    #[test]
    fn default_matches_documented_constants() {
        let cfg = SandboxConfiguration::default();
        assert_eq!(cfg.get_input_data_size(), SandboxConfiguration::DEFAULT_INPUT_SIZE);
        assert_eq!(
            cfg.max_execution_time(),
            Duration::from_millis(SandboxConfiguration::DEFAULT_MAX_EXECUTION_TIME_MS as u64)
        );
    }
}
