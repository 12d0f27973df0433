//! Scoped RBAC authorization engine
//!
//! This crate decides whether a subject may perform an action on an object
//! within a domain. It provides:
//! - A declarative model language (request/policy shapes, role definitions,
//!   effect and a boolean matcher) compiled and type-checked up front
//! - A relationship store holding policy rows and role tuples
//! - Role graphs with transitive inheritance, global and domain-scoped edges
//! - Hierarchical domain matching (`org:acme/project:payments` covers
//!   everything below it)
//! - Inverse queries: roles of a subject, permissions, listable objects
//!
//! # Core Concepts
//!
//! - **Subject**: the requesting principal (`user:alice`, `group:teamA`)
//! - **Role**: a named bundle of permissions (`role:deployer`)
//! - **Domain**: the scope a role tuple is valid in; with a prefix matcher a
//!   tuple granted at a domain also holds in every nested domain
//! - **Policy row**: ordered values shaped by `[policy_definition]`
//! - **Role tuple**: `(subject, role[, domain])` edge in a role graph
//!
//! # Example
//!
//! ```rust
//! use authz_engine::{DomainMatcher, EngineConfig, Enforcer, Model, PolicyRule, RoleTuple};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Model::from_text(
//!         r#"
//! [request_definition]
//! r = sub, dom, obj, act
//!
//! [policy_definition]
//! p = sub, obj, act
//!
//! [role_definition]
//! g = _, _, _
//!
//! [policy_effect]
//! e = some(where (p.eft == allow))
//!
//! [matchers]
//! m = g(r.sub, p.sub, r.dom) && r.obj == p.obj && r.act == p.act
//! "#,
//!     )?;
//!     let config = EngineConfig::default().with_domain_matcher("g", DomainMatcher::hierarchical());
//!     let enforcer = Enforcer::new(model, config)?;
//!
//!     enforcer.add_policy(PolicyRule::new(["role:deployer", "component", "deploy"])).await?;
//!     enforcer
//!         .add_role_tuple(
//!             "g",
//!             RoleTuple::in_domain("group:teamA", "role:deployer", "org:acme/project:payments"),
//!         )
//!         .await?;
//!
//!     let allowed = enforcer.enforce(&[
//!         "group:teamA",
//!         "org:acme/project:payments/component:billing",
//!         "component",
//!         "deploy",
//!     ])?;
//!     assert!(allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod domain;
pub mod enforcer;
pub mod error;
pub mod eval;
pub mod expr;
pub mod model;
pub mod models;
pub mod role_graph;
pub mod store;

pub use adapter::{CsvFileAdapter, InMemoryAdapter, PolicyAdapter};
pub use config::EngineConfig;
pub use domain::DomainMatcher;
pub use enforcer::*;
pub use error::*;
pub use model::{Effect, FieldSet, Model, ModelDefinition, RoleDefinition};
pub use models::*;
