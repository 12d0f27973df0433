//! Bootstrap and demo driver for the scoped RBAC engine
//!
//! Loads [`Settings`](settings::Settings), builds an
//! [`Enforcer`](authz_engine::Enforcer) over a CSV policy file and exposes
//! the query surface as subcommands:
//!
//! ```bash
//! # Single decision
//! authz check group:teamA org:acme/project:payments/component:billing component deploy
//!
//! # Direct or inherited roles
//! authz roles group:teamA --domain org:acme/project:payments --implicit
//!
//! # Policy rows reachable through the subject's roles
//! authz permissions user:alice --implicit
//!
//! # Objects of a type the subject may act on
//! authz list-objects user:alice read document
//!
//! # Batch of expectations from a YAML file
//! authz scenarios demos/scoped-rbac/scenarios.yaml
//! ```

pub mod scenario;
pub mod settings;

use anyhow::{Context, Result};
use authz_engine::{CsvFileAdapter, Enforcer, Model};
use settings::Settings;
use std::sync::Arc;
use tracing::info;

/// Build an enforcer from settings: compile the model, attach the CSV
/// adapter and load its rows
pub async fn bootstrap(settings: &Settings) -> Result<Enforcer> {
    let model = Model::from_file(&settings.model)
        .await
        .with_context(|| format!("failed to load model {}", settings.model.display()))?;
    let adapter = Arc::new(CsvFileAdapter::new(&settings.policy));
    let enforcer = Enforcer::from_adapter(model, settings.engine.clone(), adapter)
        .await
        .with_context(|| format!("failed to load policy {}", settings.policy.display()))?;
    enforcer.add_known_objects(&settings.known_objects);

    info!(
        model = %settings.model.display(),
        policy = %settings.policy.display(),
        "Enforcer ready"
    );
    Ok(enforcer)
}
