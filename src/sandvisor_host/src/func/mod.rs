use crate::Result;
use std::sync::{Arc, Mutex};

/// Definitions for common functions to be exposed in the guest.
pub(crate) mod exports;
/// The wire encoding shared by host-to-guest and guest-to-host calls.
pub(crate) mod function_call;
/// Types used to pass data to/from the guest.
pub(crate) mod guest;
/// Definitions and functionality to enable guest-to-host function calling.
///
/// This module includes functionality to do the following:
///
/// - Describe a host function's name, parameter types, and return type
/// - Register host functions so the guest can discover and call them
/// - Dispatch a call from the guest to the appropriate host function
pub(crate) mod host;
/// Definitions for types related to functions used by both the guest and
/// the host: parameter/return values and their type tags.
pub(crate) mod types;

pub(crate) use types::{ParameterType, ParameterValue, ReturnType, ReturnValue};

type BoxedHostFunction<'a> =
    Arc<Mutex<Box<dyn FnMut(Vec<ParameterValue>) -> Result<ReturnValue> + 'a + Send>>>;

/// A host function exposed to the guest, type-erased behind a closure.
#[derive(Clone)]
pub struct SandboxHostFunction<'a>(BoxedHostFunction<'a>);

impl<'a> SandboxHostFunction<'a> {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnMut(Vec<ParameterValue>) -> Result<ReturnValue> + 'a + Send,
    {
        Self(Arc::new(Mutex::new(Box::new(f))))
    }

    pub(crate) fn call(&self, args: Vec<ParameterValue>) -> Result<ReturnValue> {
        let mut f = self.0.lock().unwrap();
        f(args)
    }
}
