/// The error a guest reports back to the host when it cannot continue.
pub mod error;
/// Represents a function call from host to guest.
pub mod function_call;
/// Represents guest log data.
pub mod log_data;
/// An enumeration and supporting logic to determine the desired
/// level of a log message issued from the guest.
pub(crate) mod log_level;
