//! Registered callable units and the registry that owns them.

pub mod context;
pub mod definition;
pub mod registry;

pub use context::ExecutionContext;
pub use definition::{FunctionDefinition, FunctionKind, ParamSpec, ParamType};
pub use registry::{
    CallableFunction, FnHandler, FunctionHandler, FunctionRegistry, RegistryError, handler_fn,
    in_handler,
};
