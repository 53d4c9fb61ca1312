//! Shared fixtures for integration tests that live outside `sandvisor-host`'s
//! own crate boundary and so can't reach its `pub(crate)` test helpers.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

/// This crate's own manifest directory, used as the anchor for locating
/// fixtures that live alongside `sandvisor-host`.
pub const MANIFEST_DIR: &str = env!("CARGO_MANIFEST_DIR");

fn join_to_path(start: &str, parts: &[&str]) -> PathBuf {
    let mut pb = PathBuf::from(start);
    for part in parts {
        pb.push(part);
    }
    pb
}

/// A `PathBuf` pointing at the minimal PE32+ guest used by sandbox
/// lifecycle tests: it exports an `Echo` function and nothing else.
///
/// `$REPO_ROOT/src/sandvisor_host/testdata/simpleguest.exe`
pub fn simple_guest_as_pathbuf() -> PathBuf {
    join_to_path(
        MANIFEST_DIR,
        &["..", "sandvisor_host", "testdata", "simpleguest.exe"],
    )
}

/// A fully qualified path to `simpleguest.exe`, as an owned `String`.
pub fn simple_guest_as_string() -> Result<String> {
    simple_guest_as_pathbuf()
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("couldn't convert simple guest PathBuf to string"))
}

/// A `PathBuf` pointing at the PE32+ guest used by host-function callback
/// tests: it calls back into the host as part of servicing a guest call.
///
/// `$REPO_ROOT/src/sandvisor_host/testdata/callbackguest.exe`
pub fn callback_guest_as_pathbuf() -> PathBuf {
    join_to_path(
        MANIFEST_DIR,
        &["..", "sandvisor_host", "testdata", "callbackguest.exe"],
    )
}

/// A fully qualified path to `callbackguest.exe`, as an owned `String`.
pub fn callback_guest_as_string() -> Result<String> {
    callback_guest_as_pathbuf()
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("couldn't convert callback guest PathBuf to string"))
}

/// A wire-encoded `FunctionCall` calling `Echo("hello")`, for tests that
/// exercise the guest call dispatch path without needing a real running
/// sandbox to produce one.
///
/// Layout: `[u32 total_len][u32 name_len]"Echo"[u32 param_count][u8 tag=String][u32 len]"hello"`
pub fn get_guest_function_call_test_data() -> Vec<u8> {
    let mut body = Vec::new();
    let name = b"Echo";
    body.extend_from_slice(&(name.len() as u32).to_le_bytes());
    body.extend_from_slice(name);
    body.extend_from_slice(&1u32.to_le_bytes());
    let arg = b"hello";
    body.push(0u8); // ParameterType::String tag
    body.extend_from_slice(&(arg.len() as u32).to_le_bytes());
    body.extend_from_slice(arg);

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_paths_are_absolute() {
        assert!(simple_guest_as_pathbuf().is_absolute());
        assert!(callback_guest_as_pathbuf().is_absolute());
    }

    #[test]
    fn guest_function_call_test_data_round_trips_length_prefix() {
        let data = get_guest_function_call_test_data();
        let total_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        assert_eq!(data.len(), 4 + total_len);
    }
}
