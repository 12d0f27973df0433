use crate::{
    error::{AuthzError, Result},
    model::Model,
    models::{PolicyRule, RoleTuple, StoredRule},
};
use std::collections::{BTreeMap, BTreeSet};

/// A stored row resolved against the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Policy(PolicyRule),
    Role { definition: String, tuple: RoleTuple },
}

impl Entry {
    pub fn to_stored(&self, policy_key: &str) -> StoredRule {
        match self {
            Self::Policy(rule) => StoredRule::policy(policy_key, rule),
            Self::Role { definition, tuple } => StoredRule::role(definition, tuple),
        }
    }
}

/// In-memory policy rows and role tuples for one model.
///
/// The store does not de-duplicate: adding a row twice keeps two copies,
/// and removal drops every equal copy.
#[derive(Debug, Clone)]
pub struct RelationshipStore {
    policy_key: String,
    policy_arity: usize,
    role_arity: BTreeMap<String, usize>,
    policies: Vec<PolicyRule>,
    role_tuples: BTreeMap<String, Vec<RoleTuple>>,
    known_objects: BTreeSet<String>,
}

impl RelationshipStore {
    pub fn new(model: &Model) -> Self {
        let role_arity: BTreeMap<String, usize> = model
            .roles()
            .map(|definition| (definition.name.clone(), definition.arity))
            .collect();
        let role_tuples = role_arity.keys().map(|name| (name.clone(), Vec::new())).collect();

        Self {
            policy_key: model.policy().key.clone(),
            policy_arity: model.policy().len(),
            role_arity,
            policies: Vec::new(),
            role_tuples,
            known_objects: BTreeSet::new(),
        }
    }

    pub fn policy_key(&self) -> &str {
        &self.policy_key
    }

    // =============================================================================
    // Validation
    // =============================================================================

    pub fn validate_policy(&self, rule: &PolicyRule) -> Result<()> {
        if rule.len() != self.policy_arity {
            return Err(AuthzError::MalformedTuple(format!(
                "policy {} has {} fields, expected {}",
                rule,
                rule.len(),
                self.policy_arity
            )));
        }
        reject_line_breaks(rule.values.iter().map(String::as_str))
    }

    pub fn validate_role(&self, definition: &str, tuple: &RoleTuple) -> Result<()> {
        let arity = self
            .role_arity
            .get(definition)
            .ok_or_else(|| AuthzError::UnknownRoleDefinition(definition.to_string()))?;
        if tuple.domain.is_some() && *arity < 3 {
            return Err(AuthzError::MalformedTuple(format!(
                "role tuple {tuple} carries a domain but '{definition}' is not domain-scoped"
            )));
        }
        if tuple.subject.is_empty() || tuple.role.is_empty() {
            return Err(AuthzError::MalformedTuple(format!(
                "role tuple {tuple} has an empty subject or role"
            )));
        }
        let values = [tuple.subject.as_str(), tuple.role.as_str()];
        reject_line_breaks(values.into_iter().chain(tuple.domain.as_deref()))
    }

    /// Resolve an adapter row into a validated entry
    pub fn resolve(&self, stored: &StoredRule) -> Result<Entry> {
        if stored.ptype == self.policy_key {
            let rule = PolicyRule::new(stored.values.iter().cloned());
            self.validate_policy(&rule)?;
            return Ok(Entry::Policy(rule));
        }

        if !self.role_arity.contains_key(&stored.ptype) {
            return Err(AuthzError::MalformedTuple(format!(
                "unknown section '{}' in row {}",
                stored.ptype, stored
            )));
        }
        let tuple = RoleTuple::from_values(&stored.values).ok_or_else(|| {
            AuthzError::MalformedTuple(format!("role row {stored} must have 2 or 3 fields"))
        })?;
        self.validate_role(&stored.ptype, &tuple)?;
        Ok(Entry::Role {
            definition: stored.ptype.clone(),
            tuple,
        })
    }

    // =============================================================================
    // Policy rows
    // =============================================================================

    pub fn add_policy(&mut self, rule: PolicyRule) {
        self.policies.push(rule);
    }

    pub fn remove_policy(&mut self, rule: &PolicyRule) -> usize {
        let before = self.policies.len();
        self.policies.retain(|existing| existing != rule);
        before - self.policies.len()
    }

    pub fn all_policies(&self) -> &[PolicyRule] {
        &self.policies
    }

    /// Rows whose field at `field_index` equals `value`
    pub fn filter_policy(&self, field_index: usize, value: &str) -> Vec<PolicyRule> {
        self.filtered_policy(field_index, &[value])
    }

    /// Rows matching `values` positionally from `field_index`; an empty
    /// string acts as a wildcard
    pub fn filtered_policy(&self, field_index: usize, values: &[&str]) -> Vec<PolicyRule> {
        self.policies
            .iter()
            .filter(|rule| row_matches(rule, field_index, values))
            .cloned()
            .collect()
    }

    /// Distinct values of one policy column
    pub fn column_values(&self, field_index: usize) -> BTreeSet<String> {
        self.policies
            .iter()
            .filter_map(|rule| rule.get(field_index))
            .map(str::to_string)
            .collect()
    }

    // =============================================================================
    // Role tuples
    // =============================================================================

    pub fn add_role_tuple(&mut self, definition: &str, tuple: RoleTuple) {
        self.role_tuples.entry(definition.to_string()).or_default().push(tuple);
    }

    pub fn remove_role_tuple(&mut self, definition: &str, tuple: &RoleTuple) -> usize {
        let Some(tuples) = self.role_tuples.get_mut(definition) else {
            return 0;
        };
        let before = tuples.len();
        tuples.retain(|existing| existing != tuple);
        before - tuples.len()
    }

    pub fn role_tuples(&self, definition: &str) -> &[RoleTuple] {
        self.role_tuples
            .get(definition)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // =============================================================================
    // Object universe
    // =============================================================================

    pub fn add_known_object(&mut self, object: &str) {
        self.known_objects.insert(object.to_string());
    }

    pub fn known_objects(&self) -> &BTreeSet<String> {
        &self.known_objects
    }

    /// Apply a resolved entry; returns the number of rows removed (0 for adds)
    pub fn apply(&mut self, entry: &Entry, add: bool) -> usize {
        match (entry, add) {
            (Entry::Policy(rule), true) => {
                self.add_policy(rule.clone());
                0
            }
            (Entry::Policy(rule), false) => self.remove_policy(rule),
            (Entry::Role { definition, tuple }, true) => {
                self.add_role_tuple(definition, tuple.clone());
                0
            }
            (Entry::Role { definition, tuple }, false) => self.remove_role_tuple(definition, tuple),
        }
    }

    pub fn clear(&mut self) {
        self.policies.clear();
        for tuples in self.role_tuples.values_mut() {
            tuples.clear();
        }
    }
}

fn row_matches(rule: &PolicyRule, field_index: usize, values: &[&str]) -> bool {
    values.iter().enumerate().all(|(offset, want)| {
        want.is_empty() || rule.get(field_index + offset) == Some(*want)
    })
}

/// Rows are stored one per line, so no value may span lines
fn reject_line_breaks<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<()> {
    match values.into_iter().find(|v| v.contains(['\n', '\r'])) {
        Some(value) => Err(AuthzError::MalformedTuple(format!(
            "value {value:?} contains a line break"
        ))),
        None => Ok(()),
    }
}
