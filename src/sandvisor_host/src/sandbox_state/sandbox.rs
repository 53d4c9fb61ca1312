use std::fmt::Debug;

/// A stage in a sandbox's lifecycle: `UninitializedSandbox` or
/// `MultiUseSandbox`.
///
/// This exists so that generic helpers (the Hypervisor Handler join/kill
/// routines, `WrapperGetter` consumers) can be written once and used by
/// every lifecycle stage, rather than once per concrete sandbox type.
pub trait Sandbox: Sized + Debug {
    /// Whether a sandbox in this stage may service more than one guest call.
    fn is_reusable(&self) -> bool {
        false
    }
}
