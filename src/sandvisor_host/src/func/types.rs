#![allow(non_snake_case)]

//! The wire encoding used for every value that crosses the host/guest
//! boundary: function arguments, return values, and their type tags.
//!
//! Each encoded value is `[u32 total_len_le][u8 tag][payload]`, where
//! `total_len` counts every byte after itself (tag + payload). The
//! leading length prefix lets a reader pull a self-contained value out of
//! a larger buffer (the input/output data regions of the PEB) without
//! first knowing its type.

use crate::error::SandboxError::{self, Error};
use crate::mem::mgr::SandboxMemoryManager;
use crate::mem::{layout::SandboxMemoryLayout, shared_mem::SharedMemory};
use crate::{log_then_return, new_error};
use crate::Result;

const TAG_INT: u8 = 0;
const TAG_LONG: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_VOID: u8 = 4;
const TAG_VECBYTES: u8 = 5;

/// Supported parameter types with values for function calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    /// i32
    Int(i32),
    /// i64
    Long(i64),
    /// String
    String(String),
    /// bool
    Bool(bool),
    /// Vec<u8>
    VecBytes(Vec<u8>),
}

/// Supported parameter types for function calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    /// i32
    Int,
    /// i64
    Long,
    /// String
    String,
    /// bool
    Bool,
    /// Vec<u8>
    VecBytes,
}

/// Supported return types with values from function calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnValue {
    /// i32
    Int(i32),
    /// i64
    Long(i64),
    /// String
    String(String),
    /// bool
    Bool(bool),
    /// ()
    Void,
    /// Vec<u8>
    VecBytes(Vec<u8>),
}

/// Supported return types from function calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    /// i32
    #[default]
    Int,
    /// i64
    Long,
    /// String
    String,
    /// bool
    Bool,
    /// ()
    Void,
    /// Vec<u8>
    VecBytes,
}

impl ParameterValue {
    fn tag(&self) -> u8 {
        match self {
            ParameterValue::Int(_) => TAG_INT,
            ParameterValue::Long(_) => TAG_LONG,
            ParameterValue::String(_) => TAG_STRING,
            ParameterValue::Bool(_) => TAG_BOOL,
            ParameterValue::VecBytes(_) => TAG_VECBYTES,
        }
    }

    /// `ParameterType` this value was constructed with.
    pub fn kind(&self) -> ParameterType {
        match self {
            ParameterValue::Int(_) => ParameterType::Int,
            ParameterValue::Long(_) => ParameterType::Long,
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::Bool(_) => ParameterType::Bool,
            ParameterValue::VecBytes(_) => ParameterType::VecBytes,
        }
    }
}

fn encode_payload(tag: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = 1 + payload.len();
    let mut out = Vec::with_capacity(4 + total_len);
    out.extend_from_slice(&(total_len as u32).to_le_bytes());
    out.push(tag);
    out.extend_from_slice(payload);
    out
}

fn decode_header(value: &[u8]) -> Result<(u8, &[u8])> {
    if value.len() < 5 {
        return Err(new_error!(
            "value buffer of length {} is too short to contain a tagged value",
            value.len()
        ));
    }
    let total_len = u32::from_le_bytes(value[0..4].try_into()?) as usize;
    if value.len() < 4 + total_len || total_len == 0 {
        return Err(new_error!(
            "value buffer declares length {} but only {} bytes are available",
            total_len,
            value.len().saturating_sub(4)
        ));
    }
    Ok((value[4], &value[5..4 + total_len]))
}

fn read_len_prefixed(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < 4 {
        return Err(new_error!("buffer too short to contain a length prefix"));
    }
    let len = u32::from_le_bytes(buf[0..4].try_into()?) as usize;
    buf.get(4..4 + len)
        .ok_or_else(|| new_error!("length prefix {} exceeds buffer of {} bytes", len, buf.len()))
}

impl TryFrom<&[u8]> for ParameterValue {
    type Error = SandboxError;
    fn try_from(value: &[u8]) -> Result<Self> {
        let (tag, payload) = decode_header(value)?;
        match tag {
            TAG_INT => Ok(ParameterValue::Int(i32::from_le_bytes(
                payload.try_into()?,
            ))),
            TAG_LONG => Ok(ParameterValue::Long(i64::from_le_bytes(
                payload.try_into()?,
            ))),
            TAG_BOOL => Ok(ParameterValue::Bool(payload.first().copied().unwrap_or(0) != 0)),
            TAG_STRING => {
                let s = read_len_prefixed(payload)?;
                Ok(ParameterValue::String(
                    String::from_utf8_lossy(s).into_owned(),
                ))
            }
            TAG_VECBYTES => {
                let v = read_len_prefixed(payload)?;
                Ok(ParameterValue::VecBytes(v.to_vec()))
            }
            other => log_then_return!(Error(format!("unknown parameter value tag {other}"))),
        }
    }
}

impl TryFrom<&ParameterValue> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: &ParameterValue) -> Result<Vec<u8>> {
        let tag = value.tag();
        let payload = match value {
            ParameterValue::Int(i) => i.to_le_bytes().to_vec(),
            ParameterValue::Long(l) => l.to_le_bytes().to_vec(),
            ParameterValue::Bool(b) => vec![*b as u8],
            ParameterValue::String(s) => {
                let bytes = s.as_bytes();
                let mut v = Vec::with_capacity(4 + bytes.len());
                v.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                v.extend_from_slice(bytes);
                v
            }
            ParameterValue::VecBytes(b) => {
                let mut v = Vec::with_capacity(4 + b.len());
                v.extend_from_slice(&(b.len() as u32).to_le_bytes());
                v.extend_from_slice(b);
                v
            }
        };
        Ok(encode_payload(tag, &payload))
    }
}

impl From<ParameterType> for u8 {
    fn from(value: ParameterType) -> Self {
        match value {
            ParameterType::Int => TAG_INT,
            ParameterType::Long => TAG_LONG,
            ParameterType::String => TAG_STRING,
            ParameterType::Bool => TAG_BOOL,
            ParameterType::VecBytes => TAG_VECBYTES,
        }
    }
}

impl From<ReturnType> for u8 {
    fn from(value: ReturnType) -> Self {
        match value {
            ReturnType::Int => TAG_INT,
            ReturnType::Long => TAG_LONG,
            ReturnType::String => TAG_STRING,
            ReturnType::Bool => TAG_BOOL,
            ReturnType::Void => TAG_VOID,
            ReturnType::VecBytes => TAG_VECBYTES,
        }
    }
}

impl TryFrom<u8> for ParameterType {
    type Error = SandboxError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            TAG_INT => Ok(ParameterType::Int),
            TAG_LONG => Ok(ParameterType::Long),
            TAG_STRING => Ok(ParameterType::String),
            TAG_BOOL => Ok(ParameterType::Bool),
            TAG_VECBYTES => Ok(ParameterType::VecBytes),
            other => log_then_return!(Error(format!("unknown parameter type tag {other}"))),
        }
    }
}

impl TryFrom<u8> for ReturnType {
    type Error = SandboxError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            TAG_INT => Ok(ReturnType::Int),
            TAG_LONG => Ok(ReturnType::Long),
            TAG_STRING => Ok(ReturnType::String),
            TAG_BOOL => Ok(ReturnType::Bool),
            TAG_VOID => Ok(ReturnType::Void),
            TAG_VECBYTES => Ok(ReturnType::VecBytes),
            other => log_then_return!(Error(format!("unknown return type tag {other}"))),
        }
    }
}

macro_rules! param_value_try_into {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl TryFrom<ParameterValue> for $ty {
            type Error = SandboxError;
            fn try_from(value: ParameterValue) -> Result<Self> {
                match value {
                    ParameterValue::$variant(v) => Ok(v),
                    other => log_then_return!(Error(format!(
                        "expected parameter of type {}, got {:?}",
                        $name, other
                    ))),
                }
            }
        }
    };
}
param_value_try_into!(i32, Int, "i32");
param_value_try_into!(i64, Long, "i64");
param_value_try_into!(String, String, "String");
param_value_try_into!(bool, Bool, "bool");
param_value_try_into!(Vec<u8>, VecBytes, "Vec<u8>");

macro_rules! return_value_try_into {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl TryFrom<ReturnValue> for $ty {
            type Error = SandboxError;
            fn try_from(value: ReturnValue) -> Result<Self> {
                match value {
                    ReturnValue::$variant(v) => Ok(v),
                    other => log_then_return!(Error(format!(
                        "expected return value of type {}, got {:?}",
                        $name, other
                    ))),
                }
            }
        }
    };
}
return_value_try_into!(i32, Int, "i32");
return_value_try_into!(i64, Long, "i64");
return_value_try_into!(String, String, "String");
return_value_try_into!(bool, Bool, "bool");
return_value_try_into!(Vec<u8>, VecBytes, "Vec<u8>");

impl TryFrom<ReturnValue> for () {
    type Error = SandboxError;
    fn try_from(value: ReturnValue) -> Result<Self> {
        match value {
            ReturnValue::Void => Ok(()),
            other => log_then_return!(Error(format!(
                "expected return value of type (), got {:?}",
                other
            ))),
        }
    }
}

impl ReturnValue {
    fn tag(&self) -> u8 {
        match self {
            ReturnValue::Int(_) => TAG_INT,
            ReturnValue::Long(_) => TAG_LONG,
            ReturnValue::String(_) => TAG_STRING,
            ReturnValue::Bool(_) => TAG_BOOL,
            ReturnValue::Void => TAG_VOID,
            ReturnValue::VecBytes(_) => TAG_VECBYTES,
        }
    }

    pub(crate) fn write_to_memory(
        &self,
        shared_mem: &mut SharedMemory,
        layout: &SandboxMemoryLayout,
    ) -> Result<()> {
        let input_data_offset = usize::try_from(layout.input_data_buffer_offset)?;
        let buffer = Vec::<u8>::try_from(self)?;
        shared_mem.copy_from_slice(buffer.as_slice(), input_data_offset)
    }
}

impl TryFrom<&[u8]> for ReturnValue {
    type Error = SandboxError;
    fn try_from(value: &[u8]) -> Result<Self> {
        let (tag, payload) = decode_header(value)?;
        match tag {
            TAG_INT => Ok(ReturnValue::Int(i32::from_le_bytes(payload.try_into()?))),
            TAG_LONG => Ok(ReturnValue::Long(i64::from_le_bytes(payload.try_into()?))),
            TAG_BOOL => Ok(ReturnValue::Bool(payload.first().copied().unwrap_or(0) != 0)),
            TAG_VOID => Ok(ReturnValue::Void),
            TAG_STRING => {
                let s = read_len_prefixed(payload)?;
                Ok(ReturnValue::String(String::from_utf8_lossy(s).into_owned()))
            }
            TAG_VECBYTES => {
                let v = read_len_prefixed(payload)?;
                Ok(ReturnValue::VecBytes(v.to_vec()))
            }
            other => log_then_return!(Error(format!("unknown return value tag {other}"))),
        }
    }
}

impl TryFrom<&ReturnValue> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: &ReturnValue) -> Result<Vec<u8>> {
        let tag = value.tag();
        let payload = match value {
            ReturnValue::Int(i) => i.to_le_bytes().to_vec(),
            ReturnValue::Long(l) => l.to_le_bytes().to_vec(),
            ReturnValue::Bool(b) => vec![*b as u8],
            ReturnValue::Void => Vec::new(),
            ReturnValue::String(s) => {
                let bytes = s.as_bytes();
                let mut v = Vec::with_capacity(4 + bytes.len());
                v.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                v.extend_from_slice(bytes);
                v
            }
            ReturnValue::VecBytes(b) => {
                let mut v = Vec::with_capacity(4 + b.len());
                v.extend_from_slice(&(b.len() as u32).to_le_bytes());
                v.extend_from_slice(b);
                v
            }
        };
        Ok(encode_payload(tag, &payload))
    }
}

impl TryFrom<&SandboxMemoryManager> for ReturnValue {
    type Error = SandboxError;
    fn try_from(mgr: &SandboxMemoryManager) -> Result<Self> {
        let (shared_mem, layout): (&SharedMemory, &SandboxMemoryLayout) =
            (&mgr.shared_mem, &mgr.layout);

        let output_offset = usize::try_from(layout.output_data_buffer_offset)?;
        let total_len = shared_mem.read_u32(output_offset)? as usize;
        let mut buffer = vec![0u8; 4 + total_len];
        shared_mem.copy_to_slice(&mut buffer, output_offset)?;
        ReturnValue::try_from(buffer.as_slice())
    }
}

/// A concrete Rust type that can be passed as an argument to a host
/// function the guest calls.
///
/// Implemented for every type `ParameterValue` can hold; used by the
/// `HostFunctionN` traits to erase a typed closure into one operating on
/// `ParameterValue`s.
pub trait SupportedParameterType: TryFrom<ParameterValue, Error = SandboxError> + Send + 'static {
    /// Wrap `self` in the matching `ParameterValue` variant.
    fn into_value(self) -> ParameterValue;
    /// The `ParameterType` tag this Rust type encodes as.
    fn parameter_type() -> ParameterType;
}

macro_rules! impl_supported_parameter_type {
    ($ty:ty, $variant:ident) => {
        impl SupportedParameterType for $ty {
            fn into_value(self) -> ParameterValue {
                ParameterValue::$variant(self)
            }
            fn parameter_type() -> ParameterType {
                ParameterType::$variant
            }
        }

        impl From<$ty> for ParameterValue {
            fn from(value: $ty) -> Self {
                ParameterValue::$variant(value)
            }
        }
    };
}
impl_supported_parameter_type!(i32, Int);
impl_supported_parameter_type!(i64, Long);
impl_supported_parameter_type!(String, String);
impl_supported_parameter_type!(bool, Bool);
impl_supported_parameter_type!(Vec<u8>, VecBytes);

/// A concrete Rust type a host function can return to the guest.
pub trait SupportedReturnType: TryFrom<ReturnValue, Error = SandboxError> + Send + 'static {
    /// Wrap `self` in the matching `ReturnValue` variant.
    fn into_value(self) -> ReturnValue;
    /// The `ReturnType` tag this Rust type encodes as.
    fn return_type() -> ReturnType;
}

macro_rules! impl_supported_return_type {
    ($ty:ty, $variant:ident) => {
        impl SupportedReturnType for $ty {
            fn into_value(self) -> ReturnValue {
                ReturnValue::$variant(self)
            }
            fn return_type() -> ReturnType {
                ReturnType::$variant
            }
        }
    };
}
impl_supported_return_type!(i32, Int);
impl_supported_return_type!(i64, Long);
impl_supported_return_type!(String, String);
impl_supported_return_type!(bool, Bool);
impl_supported_return_type!(Vec<u8>, VecBytes);

impl SupportedReturnType for () {
    fn into_value(self) -> ReturnValue {
        ReturnValue::Void
    }
    fn return_type() -> ReturnType {
        ReturnType::Void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_int() {
        let v = ParameterValue::Int(42);
        let bytes = Vec::<u8>::try_from(&v).unwrap();
        assert_eq!(ParameterValue::try_from(bytes.as_slice()).unwrap(), v);
    }

    #[test]
    fn round_trip_string() {
        let v = ReturnValue::String("hello sandbox".to_string());
        let bytes = Vec::<u8>::try_from(&v).unwrap();
        assert_eq!(ReturnValue::try_from(bytes.as_slice()).unwrap(), v);
    }

    #[test]
    fn round_trip_vecbytes() {
        let v = ParameterValue::VecBytes(vec![1, 2, 3, 4, 5]);
        let bytes = Vec::<u8>::try_from(&v).unwrap();
        assert_eq!(ParameterValue::try_from(bytes.as_slice()).unwrap(), v);
    }

    #[test]
    fn void_round_trip() {
        let v = ReturnValue::Void;
        let bytes = Vec::<u8>::try_from(&v).unwrap();
        assert_eq!(ReturnValue::try_from(bytes.as_slice()).unwrap(), v);
    }

    #[test]
    fn mismatched_extraction_errors() {
        let v = ParameterValue::Int(1);
        let err = String::try_from(v);
        assert!(err.is_err());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let v = ParameterValue::Long(9000);
        let mut bytes = Vec::<u8>::try_from(&v).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(ParameterValue::try_from(bytes.as_slice()).is_err());
    }
}
