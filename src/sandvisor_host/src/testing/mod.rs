use crate::Result;
use std::fs;
use std::path::PathBuf;

/// A `log::Log` implementation that records every call it receives,
/// for assertions in tests exercising the `tracing`/`log` bridge.
pub(crate) mod logger;
/// A `tracing::Subscriber` implementation that records spans and events
/// as JSON, for assertions in tests exercising `tracing` output.
pub(crate) mod tracing_subscriber;

pub(crate) const MANIFEST_DIR: &str = env!("CARGO_MANIFEST_DIR");

fn join_to_path(start: &str, v: Vec<&str>) -> PathBuf {
    let mut pb = PathBuf::new();
    pb.push(start);
    for part in v {
        pb.push(part);
    }
    pb
}

/// A `PathBuf` pointing at the minimal PE32+ fixture used by PE-parser
/// and memory-manager tests.
pub(crate) fn simple_guest_buf() -> PathBuf {
    join_to_path(MANIFEST_DIR, vec!["testdata", "simpleguest.exe"])
}

/// A `PathBuf` pointing at the PE32+ fixture used by host-function
/// callback tests.
pub(crate) fn callback_guest_buf() -> PathBuf {
    join_to_path(MANIFEST_DIR, vec!["testdata", "callbackguest.exe"])
}

/// Read the file at `path_buf` into a `Vec<u8>`.
pub(crate) fn bytes_for_path(path_buf: PathBuf) -> Result<Vec<u8>> {
    let guest_path = path_buf
        .as_path()
        .to_str()
        .ok_or_else(|| crate::new_error!("couldn't convert guest {:?} to a path", path_buf))?;
    fs::read(guest_path)
        .map_err(|e| crate::new_error!("failed to open guest at path {guest_path} ({e})"))
}
