use crate::error::SandboxError;
use crate::Result;
use log::Level;

/// Severity of a log message issued by the guest.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum LogLevel {
    Trace = 0,
    Debug = 1,
    Information = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
    None = 6,
}

impl From<LogLevel> for u8 {
    fn from(val: LogLevel) -> u8 {
        val as u8
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = SandboxError;
    fn try_from(val: u8) -> Result<LogLevel> {
        match val {
            0 => Ok(LogLevel::Trace),
            1 => Ok(LogLevel::Debug),
            2 => Ok(LogLevel::Information),
            3 => Ok(LogLevel::Warning),
            4 => Ok(LogLevel::Error),
            5 => Ok(LogLevel::Critical),
            6 => Ok(LogLevel::None),
            other => Err(crate::new_error!("unknown guest log level byte {}", other)),
        }
    }
}

impl From<&LogLevel> for Level {
    fn from(val: &LogLevel) -> Level {
        match val {
            LogLevel::Trace => Level::Trace,
            LogLevel::Debug => Level::Debug,
            LogLevel::Information => Level::Info,
            LogLevel::Warning => Level::Warn,
            LogLevel::Error => Level::Error,
            LogLevel::Critical => Level::Error,
            // If the log level is None then we will log as trace
            LogLevel::None => Level::Trace,
        }
    }
}

impl From<LogLevel> for Level {
    fn from(val: LogLevel) -> Level {
        Level::from(&val)
    }
}
