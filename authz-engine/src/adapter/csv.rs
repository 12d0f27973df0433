//! File-backed adapter using the comma-separated policy format:
//!
//! ```text
//! # policies
//! p, role:deployer, component, deploy
//! # role tuples (subject, role[, domain])
//! g, group:teamA, role:deployer, org:acme/project:payments
//! p, user:a, "report:q1,q2", read
//! ```
//!
//! Values holding a comma, a double quote, or leading/trailing whitespace are
//! wrapped in double quotes with inner quotes doubled.
//!
//! Writes rewrite the whole file through a temporary sibling that is renamed
//! into place, so a failed write leaves the previous file untouched.

use crate::{
    adapter::PolicyAdapter,
    error::{AuthzError, Result},
    models::*,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct CsvFileAdapter {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl CsvFileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_rows(&self) -> Result<Vec<StoredRule>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Policy file {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        parse_rows(&text)
    }
}

/// Parse policy lines; blank lines and `#` comments are skipped
pub fn parse_rows(text: &str) -> Result<Vec<StoredRule>> {
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = split_fields(line)
            .map_err(|reason| AuthzError::MalformedTuple(format!("line {}: {reason}", idx + 1)))?
            .into_iter();
        let ptype = fields.next().unwrap_or_default();
        let values: Vec<String> = fields.collect();
        if ptype.is_empty() || values.is_empty() {
            return Err(AuthzError::MalformedTuple(format!(
                "line {}: expected `<type>, <value>, ...`",
                idx + 1
            )));
        }
        rows.push(StoredRule { ptype, values });
    }
    Ok(rows)
}

/// Split one line on commas. Unquoted fields are trimmed; quoted fields keep
/// their content verbatim with `""` read as `"`.
fn split_fields(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let field = if chars.next_if_eq(&'"').is_some() {
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') if chars.next_if_eq(&'"').is_some() => value.push('"'),
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => return Err("unterminated quoted value".to_string()),
                }
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_some_and(|c| *c != ',') {
                return Err("unexpected text after quoted value".to_string());
            }
            value
        } else {
            let mut value = String::new();
            while let Some(c) = chars.next_if(|c| *c != ',') {
                if c == '"' {
                    return Err("stray quote in unquoted value".to_string());
                }
                value.push(c);
            }
            value.trim().to_string()
        };
        fields.push(field);

        if chars.next().is_none() {
            return Ok(fields);
        }
    }
}

fn render_field(value: &str) -> String {
    let needs_quotes = value.contains([',', '"'])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_rows(rows: &[StoredRule]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&render_field(&row.ptype));
        for value in &row.values {
            out.push_str(", ");
            out.push_str(&render_field(value));
        }
        out.push('\n');
    }
    out
}

/// Write `contents` to a sibling staging file and rename it over `path`
async fn replace_file(path: &Path, contents: &str) -> Result<()> {
    let staging = path.with_extension("csv.tmp");
    tokio::fs::write(&staging, contents)
        .await
        .map_err(|e| AuthzError::Adapter(format!("failed to write {}: {e}", staging.display())))?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
            warn!("Could not remove {}: {cleanup}", staging.display());
        }
        return Err(AuthzError::Adapter(format!("failed to replace {}: {e}", path.display())));
    }
    Ok(())
}

#[async_trait]
impl PolicyAdapter for CsvFileAdapter {
    async fn load(&self) -> Result<Vec<StoredRule>> {
        let rows = self.read_rows().await?;
        info!("Loaded {} rows from {}", rows.len(), self.path.display());
        Ok(rows)
    }

    async fn write(&self, batch: &WriteBatch) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut rows = self.read_rows().await?;
        rows.retain(|row| !batch.deletes.contains(row));
        rows.extend(batch.writes.iter().cloned());

        replace_file(&self.path, &render_rows(&rows)).await?;

        debug!(
            writes = batch.writes.len(),
            deletes = batch.deletes.len(),
            path = %self.path.display(),
            "Rewrote policy file"
        );
        Ok(())
    }
}
