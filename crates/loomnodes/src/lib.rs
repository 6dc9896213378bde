//! Standard node library
//!
//! Collection of built-in work invokers for common operations

mod debug;
mod http;
mod time;
mod transform;

pub use debug::{DebugNode, DebugNodeFactory};
pub use http::{HttpRequestNode, HttpRequestNodeFactory};
pub use time::{DelayNode, DelayNodeFactory};
pub use transform::{JsonParseNode, JsonParseNodeFactory, JsonStringifyNode, JsonStringifyNodeFactory};

use loomruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(DebugNodeFactory));
    registry.register(Arc::new(HttpRequestNodeFactory::new()));
    registry.register(Arc::new(JsonParseNodeFactory));
    registry.register(Arc::new(JsonStringifyNodeFactory));
    registry.register(Arc::new(DelayNodeFactory));
}

/// A registry holding every standard node
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
