//! Scenario files: named requests with the expected outcome, run against a
//! loaded enforcer.
//!
//! ```yaml
//! checks:
//!   - name: team A deploys billing
//!     request: ["group:teamA", "org:acme/project:payments/component:billing", "component", "deploy"]
//!     expect: allow
//! object_queries:
//!   - name: alice reads documents
//!     subject: user:alice
//!     action: read
//!     object_type: document
//!     expect: ["document:doc1"]
//! ```

use anyhow::{Context, Result};
use authz_engine::{Enforcer, ListObjectsRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    Allow,
    Deny,
}

impl Expectation {
    fn holds(self, allowed: bool) -> bool {
        allowed == (self == Expectation::Allow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckScenario {
    pub name: String,
    pub request: Vec<String>,
    pub expect: Expectation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectQueryScenario {
    pub name: String,
    #[serde(flatten)]
    pub query: ListObjectsRequest,
    pub expect: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioFile {
    #[serde(default)]
    pub checks: Vec<CheckScenario>,
    #[serde(default)]
    pub object_queries: Vec<ObjectQueryScenario>,
}

impl ScenarioFile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("invalid scenario file")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: Vec<Outcome>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }
}

/// Run every scenario. Engine errors (e.g. a request of the wrong arity)
/// count as failures rather than aborting the run.
pub fn run(enforcer: &Enforcer, scenarios: &ScenarioFile) -> Report {
    let mut report = Report::default();

    for check in &scenarios.checks {
        let request: Vec<&str> = check.request.iter().map(String::as_str).collect();
        let outcome = match enforcer.enforce(&request) {
            Ok(allowed) => Outcome {
                name: check.name.clone(),
                passed: check.expect.holds(allowed),
                detail: format!("expected {:?}, got {}", check.expect, if allowed { "allow" } else { "deny" }),
            },
            Err(e) => Outcome {
                name: check.name.clone(),
                passed: false,
                detail: e.to_string(),
            },
        };
        debug!(name = %outcome.name, passed = outcome.passed, "Check scenario");
        report.outcomes.push(outcome);
    }

    for query in &scenarios.object_queries {
        let outcome = match enforcer.list_objects(&query.query) {
            Ok(objects) => Outcome {
                name: query.name.clone(),
                passed: objects == query.expect,
                detail: format!("expected {:?}, got {:?}", query.expect, objects),
            },
            Err(e) => Outcome {
                name: query.name.clone(),
                passed: false,
                detail: e.to_string(),
            },
        };
        debug!(name = %outcome.name, passed = outcome.passed, "Object query scenario");
        report.outcomes.push(outcome);
    }

    if !report.all_passed() {
        warn!("{} of {} scenarios failed", report.failed(), report.outcomes.len());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz_engine::{EngineConfig, Model, PolicyRule};

    const ACL: &str = "[request_definition]\nr = sub, obj, act\n[policy_definition]\np = sub, obj, act\n[matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n";

    #[tokio::test]
    async fn test_run_reports_failures() {
        let enforcer = Enforcer::new(Model::from_text(ACL).unwrap(), EngineConfig::default()).unwrap();
        enforcer
            .add_policy(PolicyRule::new(["user:alice", "document:doc1", "read"]))
            .await
            .unwrap();

        let scenarios = ScenarioFile::from_yaml(
            r#"
checks:
  - name: alice reads doc1
    request: ["user:alice", "document:doc1", "read"]
    expect: allow
  - name: bob reads doc1
    request: ["user:bob", "document:doc1", "read"]
    expect: allow
  - name: wrong arity
    request: ["user:alice", "document:doc1"]
    expect: deny
object_queries:
  - name: alice documents
    subject: user:alice
    action: read
    object_type: document
    expect: ["document:doc1"]
"#,
        )
        .unwrap();

        let report = run(&enforcer, &scenarios);
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.passed(), 2);
        assert!(!report.all_passed());
        assert!(report.outcomes.iter().any(|o| o.name == "alice documents" && o.passed));
    }
}
