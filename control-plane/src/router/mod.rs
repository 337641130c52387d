//! Task routing: rules, descriptors and the complexity-based engine.

pub mod engine;
pub mod rules;
pub mod task;

pub use engine::{RoutingEngine, INSUFFICIENT_LOCAL_RESOURCES, USER_OVERRIDE};
pub use rules::{default_rules, RoutingRule, RuleSet};
pub use task::{Backend, Priority, RoutingDecision, TaskDescriptor};
