//! Routing rules
//!
//! Rules are declared in config as plain data and compiled once at load
//! time. A rule that fails to compile rejects the whole config.

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::router::task::Backend;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A configured routing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Regex matched against `task_type`
    pub pattern: String,
    /// Complexity asserted for matching tasks, in [0, 1]
    pub complexity: f64,
    /// Advisory backend, used only to break ties near the threshold
    pub preferred_backend: Backend,
    /// Model to select when this rule decides the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl RoutingRule {
    pub fn new(pattern: impl Into<String>, complexity: f64, preferred_backend: Backend) -> Self {
        Self {
            pattern: pattern.into(),
            complexity,
            preferred_backend,
            model: None,
        }
    }

    /// With a model override
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Check ranges and compile the pattern
    pub fn compile(&self) -> ControlPlaneResult<CompiledRule> {
        if !(0.0..=1.0).contains(&self.complexity) {
            return Err(ControlPlaneError::validation(format!(
                "rule '{}': complexity {} outside [0, 1]",
                self.pattern, self.complexity
            )));
        }
        let regex = Regex::new(&self.pattern).map_err(|e| {
            ControlPlaneError::validation(format!("rule '{}': invalid pattern: {}", self.pattern, e))
        })?;
        Ok(CompiledRule {
            rule: self.clone(),
            regex,
        })
    }
}

/// Rule with its pattern compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: RoutingRule,
    regex: Regex,
}

impl CompiledRule {
    pub fn matches(&self, task_type: &str) -> bool {
        self.regex.is_match(task_type)
    }
}

/// Ordered, compiled rule set. First match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules in declaration order
    pub fn compile(rules: &[RoutingRule]) -> ControlPlaneResult<Self> {
        let rules = rules
            .iter()
            .map(RoutingRule::compile)
            .collect::<ControlPlaneResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// First rule whose pattern matches `task_type`
    pub fn first_match(&self, task_type: &str) -> Option<&RoutingRule> {
        self.rules
            .iter()
            .find(|r| r.matches(task_type))
            .map(|r| &r.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Built-in rules used when the config declares none.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new("^code_generation$", 0.9, Backend::Cloud),
        RoutingRule::new("^(complex_)?reasoning$|^analysis$", 0.8, Backend::Cloud),
        RoutingRule::new("^summari[sz]ation$", 0.5, Backend::Local),
        RoutingRule::new("^translation$", 0.4, Backend::Local),
        RoutingRule::new("^(speech|vision)_", 0.3, Backend::Local),
        RoutingRule::new("^simple_chat$", 0.2, Backend::Local),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            RoutingRule::new("^code", 0.9, Backend::Cloud),
            RoutingRule::new("generation$", 0.1, Backend::Local),
        ];
        let set = RuleSet::compile(&rules).unwrap();
        let hit = set.first_match("code_generation").unwrap();
        assert_eq!(hit.pattern, "^code");
        assert_eq!(set.first_match("image_generation").unwrap().complexity, 0.1);
        assert!(set.first_match("chat").is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = RuleSet::compile(&[RoutingRule::new("(unclosed", 0.5, Backend::Local)])
            .unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_out_of_range_complexity_rejected() {
        assert!(RoutingRule::new("x", 1.5, Backend::Cloud).compile().is_err());
        assert!(RoutingRule::new("x", -0.1, Backend::Cloud).compile().is_err());
    }

    #[test]
    fn test_default_rules_compile() {
        let set = RuleSet::compile(&default_rules()).unwrap();
        assert_eq!(set.first_match("code_generation").unwrap().complexity, 0.9);
        assert_eq!(set.first_match("simple_chat").unwrap().complexity, 0.2);
        assert_eq!(
            set.first_match("vision_caption").unwrap().preferred_backend,
            Backend::Local
        );
    }
}
