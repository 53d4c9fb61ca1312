use crate::func::types::{ParameterType, ParameterValue, SupportedParameterType, SupportedReturnType};
use crate::func::SandboxHostFunction;
use crate::new_error;
use crate::sandbox::UninitializedSandbox;
use crate::Result;
use std::sync::{Arc, Mutex};

/// The name, parameter types, and return type of a function the host
/// exposes to the guest.
pub(crate) mod function_definition;
/// A call, made by the guest, to a function the host has exposed.
pub(crate) mod function_call;
/// The sorted collection of host functions a sandbox has registered.
pub(crate) mod function_details;

use function_definition::HostFunctionDefinition;

/// Generate a `HostFunctionN` trait (and its blanket impl for
/// `Arc<Mutex<F>>`) for a host function taking `N` typed parameters.
///
/// Registering a closure with one of these traits erases it into a
/// `SandboxHostFunction` operating on `Vec<ParameterValue>`, and records a
/// `HostFunctionDefinition` describing its signature so the guest can
/// discover it.
macro_rules! impl_host_function {
    ($trait_name:ident $(, $param:ident)*) => {
        #[doc = concat!(
            "A host function taking ",
            stringify!($($param)*),
            " and returning a `SupportedReturnType`."
        )]
        pub trait $trait_name<'a, $($param,)* R>: Send + Sync
        where
            $($param: SupportedParameterType + Clone + 'a,)*
            R: SupportedReturnType + 'a,
        {
            /// Register this function as `name` on `sandbox`.
            fn register(&self, sandbox: &mut UninitializedSandbox, name: &str) -> Result<()>;
        }

        impl<'a, $($param,)* R, F> $trait_name<'a, $($param,)* R> for Arc<Mutex<F>>
        where
            $($param: SupportedParameterType + Clone + 'a,)*
            R: SupportedReturnType + 'a,
            F: FnMut($($param),*) -> Result<R> + Send + 'a,
        {
            #[allow(unused_mut, unused_variables, non_snake_case)]
            fn register(&self, sandbox: &mut UninitializedSandbox, name: &str) -> Result<()> {
                let cloned = self.clone();
                let host_fn = SandboxHostFunction::new(move |args: Vec<ParameterValue>| {
                    let mut iter = args.into_iter();
                    $(
                        let $param = $param::try_from(iter.next().ok_or_else(|| {
                            new_error!("missing argument for host function parameter")
                        })?)?;
                    )*
                    let mut f = cloned
                        .lock()
                        .map_err(|e| new_error!("host function lock poisoned: {:?}", e))?;
                    let result = f($($param),*)?;
                    Ok(result.into_value())
                });
                let parameter_types: Vec<ParameterType> = vec![$($param::parameter_type()),*];
                let parameter_types = if parameter_types.is_empty() {
                    None
                } else {
                    Some(parameter_types)
                };
                let hfd = HostFunctionDefinition::new(name.to_string(), parameter_types, R::return_type());
                sandbox.register_host_function(&hfd, host_fn)
            }
        }
    };
}

impl_host_function!(HostFunction0);
impl_host_function!(HostFunction1, P1);
impl_host_function!(HostFunction2, P1, P2);
impl_host_function!(HostFunction3, P1, P2, P3);
impl_host_function!(HostFunction4, P1, P2, P3, P4);
impl_host_function!(HostFunction5, P1, P2, P3, P4, P5);
impl_host_function!(HostFunction6, P1, P2, P3, P4, P5, P6);
impl_host_function!(HostFunction7, P1, P2, P3, P4, P5, P6, P7);
impl_host_function!(HostFunction8, P1, P2, P3, P4, P5, P6, P7, P8);
impl_host_function!(HostFunction9, P1, P2, P3, P4, P5, P6, P7, P8, P9);
impl_host_function!(HostFunction10, P1, P2, P3, P4, P5, P6, P7, P8, P9, P10);
