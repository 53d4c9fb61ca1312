use std::sync::{Arc, Mutex};

use super::{host_funcs::HostFuncsWrapper, mem_mgr::MemMgrWrapper};
use crate::func::types::ParameterValue;
use crate::hypervisor::handlers::{OutBHandler, OutBHandlerFunction, OutBHandlerWrapper};
use crate::{SandboxError, Result};
use crate::func::guest::log_data::GuestLogData;
use log::{Level, Record};
use tracing::instrument;
use tracing_log::format_trace;

/// The three actions a guest can request via the `outb` port reserved
/// for host communication.
pub(super) enum OutBAction {
    Log,
    CallFunction,
    Abort,
}

impl From<u16> for OutBAction {
    fn from(val: u16) -> Self {
        match val {
            99 => OutBAction::Log,
            101 => OutBAction::CallFunction,
            102 => OutBAction::Abort,
            _ => OutBAction::Log,
        }
    }
}

/// Read a `GuestLogData` record out of the output data buffer and emit
/// it as either a `tracing` event or a `log` record, depending on
/// whether a tracing subscriber has been installed.
///
/// The file and line number are taken from the guest's record, not the
/// call site, since the log originates in the guest.
#[instrument(skip(mgr))]
pub(super) fn outb_log(mgr: &crate::mem::mgr::SandboxMemoryManager) -> Result<()> {
    let log_data: GuestLogData = mgr.read_guest_log_data()?;

    let record_level: Level = log_data.level.into();
    let should_trace = tracing_core::dispatcher::has_been_set();

    if should_trace {
        format_trace(
            &Record::builder()
                .args(format_args!("{}", log_data.message))
                .level(record_level)
                .target("sandvisor_guest")
                .file(Some(log_data.source_file.as_str()))
                .line(Some(log_data.line))
                .module_path(Some(log_data.source.as_str()))
                .build(),
        )?;
    } else {
        log::logger().log(
            &Record::builder()
                .args(format_args!("{}", log_data.message))
                .level(record_level)
                .target("sandvisor_guest")
                .file(Some(&log_data.source_file))
                .line(Some(log_data.line))
                .module_path(Some(&log_data.source))
                .build(),
        );
    }

    Ok(())
}

/// Handle an `outb` exit from the guest vCPU.
fn handle_outb_impl(
    mem_mgr: &mut MemMgrWrapper,
    host_funcs: Arc<Mutex<HostFuncsWrapper<'_>>>,
    port: u16,
    _payload: u64,
) -> Result<()> {
    match port.into() {
        OutBAction::Log => outb_log(mem_mgr.as_ref()),
        OutBAction::CallFunction => {
            let call = mem_mgr.as_ref().get_host_function_call()?;
            let name = call.function_name.clone();
            let args: Vec<ParameterValue> = call.parameters;
            let res = host_funcs
                .lock()
                .map_err(|_| crate::new_error!("host function registry lock poisoned"))?
                .call_host_function(&name, args)?;
            mem_mgr.as_mut().write_response_from_host_method_call(&res)?;
            Ok(())
        }
        OutBAction::Abort => Err(SandboxError::GuestAborted(0)),
    }
}

/// Build an `OutBHandlerWrapper` closing over `mem_mgr_wrapper` and
/// `host_funcs_wrapper`, to be handed to a hypervisor driver's run loop.
pub(super) fn outb_handler_wrapper<'a>(
    mut mem_mgr_wrapper: MemMgrWrapper,
    host_funcs_wrapper: Arc<Mutex<HostFuncsWrapper<'a>>>,
) -> OutBHandlerWrapper<'a> {
    let outb_func: OutBHandlerFunction<'a> = Box::new(move |port, payload| {
        handle_outb_impl(&mut mem_mgr_wrapper, host_funcs_wrapper.clone(), port, payload)
    });
    let outb_hdl = OutBHandler::from(outb_func);
    Arc::new(Mutex::new(outb_hdl))
}

#[cfg(test)]
mod tests {
    use super::outb_log;
    use crate::func::guest::log_level::LogLevel;
    use crate::mem::layout::SandboxMemoryLayout;
    use crate::mem::mgr::SandboxMemoryManager;
    use crate::mem::shared_mem::SharedMemory;
    use crate::func::guest::log_data::GuestLogData;
    use crate::sandbox::SandboxConfiguration;
    use crate::testing::logger::{Logger, LOGGER};

    fn new_mgr() -> SandboxMemoryManager {
        let cfg = SandboxConfiguration::default();
        let layout = SandboxMemoryLayout::new(cfg, 4096, 4096, 4096).unwrap();
        let mem_size = layout.get_memory_size().unwrap();
        let shared_mem = SharedMemory::new(mem_size).unwrap();
        SandboxMemoryManager::new(cfg, layout, shared_mem, 0u64.into(), 0u64.into())
    }

    fn new_guest_log_data(level: LogLevel) -> GuestLogData {
        GuestLogData {
            message: "test message".to_string(),
            source: "test source".to_string(),
            level,
            caller: "test caller".to_string(),
            source_file: "test source file".to_string(),
            line: 123,
        }
    }

    #[test]
    fn test_log_outb_log() {
        Logger::initialize_test_logger();
        LOGGER.set_max_level(log::LevelFilter::Off);

        {
            // no log data has been written yet, so this should fail
            let mgr = new_mgr();
            assert!(outb_log(&mgr).is_err());
        }
        {
            let mut mgr = new_mgr();
            let layout = mgr.layout;
            let log_msg = new_guest_log_data(LogLevel::Information);
            log_msg.write_to_memory(&mut mgr.shared_mem, &layout).unwrap();
            assert!(outb_log(&mgr).is_ok());
            assert_eq!(0, LOGGER.num_log_calls());
            LOGGER.clear_log_calls();
        }
        {
            LOGGER.set_max_level(log::LevelFilter::Trace);
            let mut mgr = new_mgr();
            LOGGER.clear_log_calls();

            let levels = vec![
                LogLevel::Trace,
                LogLevel::Debug,
                LogLevel::Information,
                LogLevel::Warning,
                LogLevel::Error,
                LogLevel::Critical,
                LogLevel::None,
            ];
            for level in levels {
                let layout = mgr.layout;
                let log_data = new_guest_log_data(level);
                log_data.write_to_memory(&mut mgr.shared_mem, &layout).unwrap();
                outb_log(&mgr).unwrap();

                LOGGER.test_log_records(|log_calls| {
                    let expected_level: log::Level = level.into();
                    assert!(
                        log_calls
                            .iter()
                            .filter(|log_call| {
                                log_call.level == expected_level
                                    && log_call.line == Some(log_data.line)
                                    && log_call.args == log_data.message
                                    && log_call.module_path == Some(log_data.source.clone())
                                    && log_call.file == Some(log_data.source_file.clone())
                            })
                            .count()
                            == 1,
                        "log call did not occur for level {:?}",
                        level,
                    );
                });
            }
        }
    }
}
