//! The built-in catalog registered at startup.

use std::sync::Arc;

use crate::function::{FunctionDefinition, FunctionHandler, FunctionRegistry, RegistryError};

pub mod echo;
pub mod heartbeat;
pub mod math;
pub mod text;

pub fn builtin_functions() -> Vec<(FunctionDefinition, Arc<dyn FunctionHandler>)> {
    vec![
        math::definition(),
        text::definition(),
        echo::definition(),
        heartbeat::definition(),
    ]
}

/// Registers every built-in; fails on the first rejected definition.
pub fn register_builtins(registry: &FunctionRegistry) -> Result<usize, RegistryError> {
    let entries = builtin_functions();
    let count = entries.len();
    for (definition, handler) in entries {
        registry.register(definition, handler)?;
    }
    Ok(count)
}
