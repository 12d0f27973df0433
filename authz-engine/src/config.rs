use crate::{domain::DomainMatcher, role_graph::DEFAULT_MAX_HIERARCHY_DEPTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Runtime options for an [`Enforcer`](crate::Enforcer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache transitive role closures between mutations
    pub cache_roles: bool,

    /// Maximum number of inheritance hops followed when resolving roles
    pub max_hierarchy_depth: usize,

    /// Domain matcher per role definition name, e.g. `g: prefix`
    pub domain_matchers: BTreeMap<String, DomainMatcher>,

    /// Emit a debug event for every enforcement decision
    pub log_decisions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_roles: true,
            max_hierarchy_depth: DEFAULT_MAX_HIERARCHY_DEPTH,
            domain_matchers: BTreeMap::new(),
            log_decisions: false,
        }
    }
}

impl EngineConfig {
    pub fn with_domain_matcher(mut self, role_definition: &str, matcher: DomainMatcher) -> Self {
        self.domain_matchers.insert(role_definition.to_string(), matcher);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_roles = false;
        self
    }
}
