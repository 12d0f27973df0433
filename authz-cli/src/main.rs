//! `authz`: query a scoped RBAC policy from the command line
//!
//! Usage:
//!   authz --config demos/scoped-rbac/authz.yaml check <request values...>
//!
//! Settings come from the YAML file given by `--config` with `AUTHZ__*`
//! environment overrides.

use anyhow::{bail, Result};
use authz_cli::{bootstrap, scenario, settings::Settings};
use authz_engine::{Enforcer, ListObjectsRequest, PolicyRule};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "authz")]
#[command(about = "Scoped RBAC policy checks and queries")]
struct Args {
    /// Settings file (YAML)
    #[arg(long, short, env = "AUTHZ_CONFIG", default_value = "authz.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide one request; values follow the model's request definition
    Check {
        #[arg(required = true)]
        request: Vec<String>,
    },
    /// Roles held by a subject
    Roles {
        subject: String,
        #[arg(long)]
        domain: Option<String>,
        /// Include inherited roles
        #[arg(long)]
        implicit: bool,
    },
    /// Policy rows granted to a subject
    Permissions {
        subject: String,
        #[arg(long)]
        domain: Option<String>,
        /// Include rows granted through roles
        #[arg(long)]
        implicit: bool,
    },
    /// Objects of a type the subject may perform an action on
    ListObjects {
        subject: String,
        action: String,
        object_type: String,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Run a YAML scenario file and report mismatches
    Scenarios { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(&args.config)?;
    info!("Using settings from {}", args.config.display());
    let enforcer = bootstrap(&settings).await?;

    match args.command {
        Command::Check { request } => check(&enforcer, &request, args.json),
        Command::Roles {
            subject,
            domain,
            implicit,
        } => {
            let roles = if implicit {
                enforcer.implicit_roles_for(&subject, domain.as_deref())?
            } else {
                enforcer.roles_for(&subject, domain.as_deref())?
            };
            print_list(roles, args.json)
        }
        Command::Permissions {
            subject,
            domain,
            implicit,
        } => {
            let rules = if implicit {
                enforcer.implicit_permissions_for(&subject, domain.as_deref())
            } else {
                enforcer.permissions_for(&subject)
            };
            print_list(rules.iter().map(PolicyRule::to_string), args.json)
        }
        Command::ListObjects {
            subject,
            action,
            object_type,
            domain,
        } => {
            let query = ListObjectsRequest {
                subject,
                action,
                object_type,
                domain,
            };
            print_list(enforcer.list_objects(&query)?, args.json)
        }
        Command::Scenarios { file } => {
            let scenarios = scenario::ScenarioFile::load(&file).await?;
            let report = scenario::run(&enforcer, &scenarios);
            for outcome in &report.outcomes {
                let mark = if outcome.passed { "✅" } else { "❌" };
                println!("{mark} {} ({})", outcome.name, outcome.detail);
            }
            println!("{} passed, {} failed", report.passed(), report.failed());
            if !report.all_passed() {
                bail!("{} scenario(s) failed", report.failed());
            }
            Ok(())
        }
    }
}

fn check(enforcer: &Enforcer, request: &[String], json: bool) -> Result<()> {
    let values: Vec<&str> = request.iter().map(String::as_str).collect();
    let decision = enforcer.enforce_ex(&values)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else if let Some(rule) = &decision.rule {
        println!("{} (by {rule})", if decision.allowed { "allow" } else { "deny" });
    } else {
        println!("{}", if decision.allowed { "allow" } else { "deny" });
    }
    Ok(())
}

fn print_list<I>(items: I, json: bool) -> Result<()>
where
    I: IntoIterator<Item = String>,
{
    let items: Vec<String> = items.into_iter().collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for item in items {
            println!("{item}");
        }
    }
    Ok(())
}
