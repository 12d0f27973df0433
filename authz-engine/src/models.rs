use serde::{Deserialize, Serialize};
use std::fmt;

/// A policy row: ordered values matching the model's policy definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyRule {
    pub values: Vec<String>,
}

impl PolicyRule {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.values.join(", "))
    }
}

/// A role assignment: `subject` holds `role`, optionally only within `domain`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleTuple {
    pub subject: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl RoleTuple {
    pub fn new(subject: &str, role: &str) -> Self {
        Self {
            subject: subject.to_string(),
            role: role.to_string(),
            domain: None,
        }
    }

    pub fn in_domain(subject: &str, role: &str, domain: &str) -> Self {
        Self {
            subject: subject.to_string(),
            role: role.to_string(),
            domain: Some(domain.to_string()),
        }
    }

    /// Builds a tuple from a raw row of two (global) or three values
    pub fn from_values(values: &[String]) -> Option<Self> {
        match values {
            [subject, role] => Some(Self::new(subject, role)),
            [subject, role, domain] => Some(Self::in_domain(subject, role, domain)),
            _ => None,
        }
    }

    pub fn to_values(&self) -> Vec<String> {
        let mut values = vec![self.subject.clone(), self.role.clone()];
        if let Some(ref domain) = self.domain {
            values.push(domain.clone());
        }
        values
    }
}

impl fmt::Display for RoleTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain {
            Some(ref domain) => write!(f, "{} -> {} @ {}", self.subject, self.role, domain),
            None => write!(f, "{} -> {}", self.subject, self.role),
        }
    }
}

/// A row as persisted by an adapter: the section key (`p`, `g`, `g2`, ...)
/// followed by its values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredRule {
    pub ptype: String,
    pub values: Vec<String>,
}

impl StoredRule {
    pub fn policy(ptype: &str, rule: &PolicyRule) -> Self {
        Self {
            ptype: ptype.to_string(),
            values: rule.values.clone(),
        }
    }

    pub fn role(ptype: &str, tuple: &RoleTuple) -> Self {
        Self {
            ptype: ptype.to_string(),
            values: tuple.to_values(),
        }
    }
}

impl fmt::Display for StoredRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.ptype, self.values.join(", "))
    }
}

/// Batch mutation, applied all-or-nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBatch {
    #[serde(default)]
    pub writes: Vec<StoredRule>,
    #[serde(default)]
    pub deletes: Vec<StoredRule>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_policy(mut self, ptype: &str, rule: PolicyRule) -> Self {
        self.writes.push(StoredRule::policy(ptype, &rule));
        self
    }

    pub fn remove_policy(mut self, ptype: &str, rule: PolicyRule) -> Self {
        self.deletes.push(StoredRule::policy(ptype, &rule));
        self
    }

    pub fn add_role(mut self, ptype: &str, tuple: RoleTuple) -> Self {
        self.writes.push(StoredRule::role(ptype, &tuple));
        self
    }

    pub fn remove_role(mut self, ptype: &str, tuple: RoleTuple) -> Self {
        self.deletes.push(StoredRule::role(ptype, &tuple));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Result of an explained enforcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// The policy row that decided the outcome, if any
    pub rule: Option<PolicyRule>,
}

impl Decision {
    pub fn deny() -> Self {
        Self {
            allowed: false,
            rule: None,
        }
    }
}
