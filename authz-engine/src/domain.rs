use crate::error::{AuthzError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Default path separator for hierarchical domains such as
/// `org:acme/project:payments/component:billing`.
pub const DEFAULT_DOMAIN_SEPARATOR: char = '/';

/// Strategy deciding whether a role granted in one domain applies to a
/// request made in another.
///
/// The set is closed on purpose: every strategy is a named variant so an
/// evaluation can always be explained by looking at the model and its
/// registered matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainMatcher {
    /// The request domain must equal the granted domain.
    #[default]
    Exact,

    /// The request domain must equal the granted domain or sit strictly
    /// below it, i.e. start with `granted + separator`.
    HierarchicalPrefix { separator: char },
}

impl DomainMatcher {
    pub fn hierarchical() -> Self {
        Self::HierarchicalPrefix {
            separator: DEFAULT_DOMAIN_SEPARATOR,
        }
    }

    /// Returns true when a grant in `granted_domain` covers `request_domain`.
    ///
    /// Not symmetric: `org:acme` covers `org:acme/project:x` but not the
    /// other way around.
    pub fn matches(&self, request_domain: &str, granted_domain: &str) -> bool {
        match self {
            Self::Exact => request_domain == granted_domain,
            Self::HierarchicalPrefix { separator } => {
                if request_domain == granted_domain {
                    return true;
                }
                request_domain
                    .strip_prefix(granted_domain)
                    .and_then(|rest| rest.strip_prefix(*separator))
                    .is_some()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::HierarchicalPrefix { .. } => "prefix",
        }
    }
}

impl fmt::Display for DomainMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::HierarchicalPrefix { separator } if *separator == DEFAULT_DOMAIN_SEPARATOR => {
                write!(f, "prefix")
            }
            Self::HierarchicalPrefix { separator } => write!(f, "prefix:{separator}"),
        }
    }
}

impl FromStr for DomainMatcher {
    type Err = AuthzError;

    /// Accepts `exact`, `prefix`, `hierarchical_prefix`, `DomainPrefix`, and
    /// `prefix:<separator>` for a custom single-character separator.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed {
            "exact" | "Exact" | "equal" => return Ok(Self::Exact),
            "prefix" | "hierarchical_prefix" | "HierarchicalPrefix" | "DomainPrefix" => {
                return Ok(Self::hierarchical())
            }
            _ => {}
        }

        if let Some(sep) = trimmed.strip_prefix("prefix:") {
            let mut chars = sep.chars();
            if let (Some(separator), None) = (chars.next(), chars.next()) {
                return Ok(Self::HierarchicalPrefix { separator });
            }
        }

        Err(AuthzError::UnknownDomainMatcher(trimmed.to_string()))
    }
}

impl Serialize for DomainMatcher {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DomainMatcher {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_matching() {
        let m = DomainMatcher::Exact;
        assert!(m.matches("org:acme", "org:acme"));
        assert!(!m.matches("org:acme/project:x", "org:acme"));
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let m = DomainMatcher::hierarchical();
        assert!(m.matches("org:acme", "org:acme"));
        assert!(m.matches("org:acme/project:payments", "org:acme"));
        assert!(m.matches(
            "org:acme/project:payments/component:billing",
            "org:acme/project:payments"
        ));
        assert!(!m.matches("org:acme/project:hello/component:billing", "org:acme/project:payments"));
        assert!(!m.matches("org:acme/project:paymentsX", "org:acme/project:payments"));
        assert!(!m.matches("org:other", "org:acme"));
        // a grant lower in the tree never covers its ancestors
        assert!(!m.matches("org:acme", "org:acme/project:payments"));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("exact".parse::<DomainMatcher>().unwrap(), DomainMatcher::Exact);
        assert_eq!("DomainPrefix".parse::<DomainMatcher>().unwrap(), DomainMatcher::hierarchical());
        assert_eq!(
            "prefix:.".parse::<DomainMatcher>().unwrap(),
            DomainMatcher::HierarchicalPrefix { separator: '.' }
        );
        assert!("regex".parse::<DomainMatcher>().is_err());
    }

    #[test]
    fn test_custom_separator() {
        let m: DomainMatcher = "prefix:.".parse().unwrap();
        assert!(m.matches("acme.payments", "acme"));
        assert!(!m.matches("acme/payments", "acme"));
    }
}
