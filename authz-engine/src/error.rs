use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("Model syntax error: {0}")]
    ModelSyntax(String),

    #[error("Unknown field '{field}' in matcher (not defined in {section})")]
    UnknownField { field: String, section: String },

    #[error("Malformed tuple: {0}")]
    MalformedTuple(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Role definition not found: {0}")]
    UnknownRoleDefinition(String),

    #[error("Unknown domain matcher: {0}")]
    UnknownDomainMatcher(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    pub(crate) fn syntax(message: impl Into<String>) -> Self {
        Self::ModelSyntax(message.into())
    }

    pub(crate) fn unknown_field(field: impl Into<String>, section: impl Into<String>) -> Self {
        Self::UnknownField {
            field: field.into(),
            section: section.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn read_missing() -> Result<String> {
        Ok(std::fs::read_to_string("/nonexistent/authz/policy.csv")?)
    }

    #[test]
    fn test_failures_map_to_typed_variants() {
        assert!(matches!(read_missing(), Err(AuthzError::Io(_))));
        assert_eq!(
            AuthzError::Adapter("storage unavailable".into()).to_string(),
            "Adapter error: storage unavailable"
        );
        assert_eq!(
            AuthzError::unknown_field("r.tenant", "request_definition").to_string(),
            "Unknown field 'r.tenant' in matcher (not defined in request_definition)"
        );
    }
}
