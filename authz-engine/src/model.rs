use crate::{
    domain::DomainMatcher,
    error::{AuthzError, Result},
    expr::{self, CompileScope, Expr},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const REQUEST_SECTION: &str = "request_definition";
const POLICY_SECTION: &str = "policy_definition";
const ROLE_SECTION: &str = "role_definition";
const EFFECT_SECTION: &str = "policy_effect";
const MATCHER_SECTION: &str = "matchers";

/// Name of the policy field that carries an explicit effect
pub const EFFECT_FIELD: &str = "eft";

/// Ordered field names of a request or policy definition (e.g. `r = sub, obj, act`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet {
    /// Prefix used by the matcher (`r`, `p`)
    pub key: String,
    pub fields: Vec<String>,
}

impl FieldSet {
    pub fn new<I, S>(key: &str, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = Self {
            key: key.to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
        };
        set.validate()?;
        Ok(set)
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.key) {
            return Err(AuthzError::syntax(format!("invalid definition key '{}'", self.key)));
        }
        if self.fields.is_empty() {
            return Err(AuthzError::syntax(format!("definition '{}' has no fields", self.key)));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if !is_identifier(field) {
                return Err(AuthzError::syntax(format!(
                    "invalid field name '{}' in definition '{}'",
                    field, self.key
                )));
            }
            if self.fields.iter().skip(i + 1).any(|other| other == field) {
                return Err(AuthzError::syntax(format!(
                    "duplicate field '{}' in definition '{}'",
                    field, self.key
                )));
            }
        }
        Ok(())
    }

    pub fn position(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.fields.join(", "))
    }
}

/// A named grouping relation (`g = _, _` or `g = _, _, _`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    /// 2 for global roles, 3 for domain-scoped roles
    pub arity: usize,
    #[serde(default)]
    pub domain_matcher: DomainMatcher,
}

impl RoleDefinition {
    pub fn new(name: &str, arity: usize) -> Result<Self> {
        let definition = Self {
            name: name.to_string(),
            arity,
            domain_matcher: DomainMatcher::default(),
        };
        definition.validate()?;
        Ok(definition)
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(AuthzError::syntax(format!("invalid role definition name '{}'", self.name)));
        }
        if self.arity != 2 && self.arity != 3 {
            return Err(AuthzError::syntax(format!(
                "role definition '{}' must have 2 or 3 fields, found {}",
                self.name, self.arity
            )));
        }
        Ok(())
    }

    pub fn has_domain(&self) -> bool {
        self.arity == 3
    }
}

/// How matching policy rows combine into a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// `some(where (p.eft == allow))`: allow if any allow row matches
    #[default]
    AllowOverride,
    /// `some(where (p.eft == allow)) && !some(where (p.eft == deny))`: allow
    /// if an allow row matches and no deny row does
    DenyOverride,
}

impl Effect {
    fn parse(expression: &str, policy_key: &str) -> Result<Self> {
        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        if compact == format!("some(where({policy_key}.{EFFECT_FIELD}==allow))") {
            Ok(Self::AllowOverride)
        } else if compact == format!("!some(where({policy_key}.{EFFECT_FIELD}==deny))")
            || compact
                == format!(
                    "some(where({policy_key}.{EFFECT_FIELD}==allow))&&!some(where({policy_key}.{EFFECT_FIELD}==deny))"
                )
        {
            Ok(Self::DenyOverride)
        } else {
            Err(AuthzError::syntax(format!("unsupported policy effect '{expression}'")))
        }
    }
}

/// Structured model, as produced by parsing the textual form or by an
/// external DSL transformation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub request: FieldSet,
    pub policy: FieldSet,
    #[serde(default)]
    pub roles: Vec<RoleDefinition>,
    #[serde(default)]
    pub effect: Effect,
    pub matcher: String,
}

impl FromStr for ModelDefinition {
    type Err = AuthzError;

    fn from_str(text: &str) -> Result<Self> {
        let sections = split_sections(text)?;

        let single = |name: &str| -> Result<(String, String)> {
            let entries = sections
                .get(name)
                .ok_or_else(|| AuthzError::syntax(format!("missing section [{name}]")))?;
            let mut it = entries.iter();
            match (it.next(), it.next()) {
                (Some((key, value)), None) => Ok((key.clone(), value.clone())),
                _ => Err(AuthzError::syntax(format!(
                    "section [{name}] must contain exactly one definition"
                ))),
            }
        };

        let (request_key, request_fields) = single(REQUEST_SECTION)?;
        let request = FieldSet::new(&request_key, split_list(&request_fields))?;

        let (policy_key, policy_fields) = single(POLICY_SECTION)?;
        let policy = FieldSet::new(&policy_key, split_list(&policy_fields))?;

        let (_, matcher) = single(MATCHER_SECTION)?;

        let effect = if sections.contains_key(EFFECT_SECTION) {
            let (_, expression) = single(EFFECT_SECTION)?;
            Effect::parse(&expression, &policy.key)?
        } else {
            Effect::default()
        };

        let mut roles = Vec::new();
        for (name, value) in sections.get(ROLE_SECTION).into_iter().flatten() {
            let placeholders = split_list(value);
            if placeholders.iter().any(|p| p != "_") {
                return Err(AuthzError::syntax(format!(
                    "role definition '{name}' must use `_` placeholders"
                )));
            }
            roles.push(RoleDefinition::new(name, placeholders.len())?);
        }

        Ok(Self {
            request,
            policy,
            roles,
            effect,
            matcher,
        })
    }
}

type Sections = BTreeMap<String, Vec<(String, String)>>;

fn split_sections(text: &str) -> Result<Sections> {
    let mut sections: Sections = BTreeMap::new();
    let mut current: Option<String> = None;

    for (line_no, line) in logical_lines(text) {
        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| AuthzError::syntax(format!("line {line_no}: malformed section header")))?
                .trim();
            let name = match name {
                "matcher_definition" => MATCHER_SECTION,
                other => other,
            };
            if ![REQUEST_SECTION, POLICY_SECTION, ROLE_SECTION, EFFECT_SECTION, MATCHER_SECTION]
                .contains(&name)
            {
                return Err(AuthzError::syntax(format!("line {line_no}: unknown section [{name}]")));
            }
            if sections.contains_key(name) {
                return Err(AuthzError::syntax(format!("line {line_no}: duplicate section [{name}]")));
            }
            sections.insert(name.to_string(), Vec::new());
            current = Some(name.to_string());
            continue;
        }

        let section = current
            .as_ref()
            .ok_or_else(|| AuthzError::syntax(format!("line {line_no}: definition outside of a section")))?;
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| AuthzError::syntax(format!("line {line_no}: expected `key = value`")))?;
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if key.is_empty() || value.is_empty() {
            return Err(AuthzError::syntax(format!("line {line_no}: expected `key = value`")));
        }

        let entries = sections.entry(section.clone()).or_default();
        if entries.iter().any(|(existing, _)| *existing == key) {
            return Err(AuthzError::syntax(format!(
                "line {line_no}: duplicate key '{key}' in [{section}]"
            )));
        }
        entries.push((key, value));
    }

    Ok(sections)
}

/// Joins `\` continuations and drops blanks and `#` comment lines.
/// Yields the 1-based line number where each logical line starts.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if pending.is_none() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        let (start, mut buffer) = pending.take().unwrap_or((idx + 1, String::new()));
        match trimmed.strip_suffix('\\') {
            Some(head) => {
                buffer.push_str(head.trim_end());
                buffer.push(' ');
                pending = Some((start, buffer));
            }
            None => {
                buffer.push_str(trimmed);
                lines.push((start, buffer.trim().to_string()));
            }
        }
    }
    if let Some((start, buffer)) = pending {
        lines.push((start, buffer.trim().to_string()));
    }
    lines
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A compiled, validated authorization model
#[derive(Debug, Clone)]
pub struct Model {
    definition: ModelDefinition,
    roles: BTreeMap<String, RoleDefinition>,
    matcher: Expr,
    needs_policy: bool,
    effect_index: Option<usize>,
}

impl Model {
    /// Compile a textual model (`[request_definition]`, `[policy_definition]`,
    /// `[role_definition]`, `[policy_effect]`, `[matchers]`)
    pub fn from_text(text: &str) -> Result<Self> {
        Self::compile(text.parse()?)
    }

    /// Compile a structured model serialized as JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: ModelDefinition = serde_json::from_str(json)
            .map_err(|e| AuthzError::syntax(format!("invalid model JSON: {e}")))?;
        Self::compile(definition)
    }

    /// Load a model file; `.json` files are read as structured models
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        debug!("Loaded model file {}", path.display());
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&text)
        } else {
            Self::from_text(&text)
        }
    }

    pub fn compile(definition: ModelDefinition) -> Result<Self> {
        definition.request.validate()?;
        definition.policy.validate()?;
        if definition.request.key == definition.policy.key {
            return Err(AuthzError::syntax(format!(
                "request and policy definitions share the key '{}'",
                definition.request.key
            )));
        }

        let mut roles = BTreeMap::new();
        for role in &definition.roles {
            role.validate()?;
            if role.name == definition.request.key || role.name == definition.policy.key {
                return Err(AuthzError::syntax(format!(
                    "role definition '{}' clashes with a request/policy key",
                    role.name
                )));
            }
            if roles.insert(role.name.clone(), role.clone()).is_some() {
                return Err(AuthzError::syntax(format!("duplicate role definition '{}'", role.name)));
            }
        }

        let raw = expr::parse_matcher(&definition.matcher)?;
        let matcher = expr::compile(
            &raw,
            &CompileScope {
                request: &definition.request,
                policy: &definition.policy,
                roles: &roles,
            },
        )?;
        let needs_policy = matcher.references_policy();
        let effect_index = definition.policy.position(EFFECT_FIELD);

        debug!(
            request = %definition.request,
            policy = %definition.policy,
            roles = roles.len(),
            "Compiled authorization model"
        );

        Ok(Self {
            definition,
            roles,
            matcher,
            needs_policy,
            effect_index,
        })
    }

    /// Register the domain matcher used by a role definition
    pub fn with_domain_matcher(mut self, role_definition: &str, matcher: DomainMatcher) -> Result<Self> {
        self.set_domain_matcher(role_definition, matcher)?;
        Ok(self)
    }

    pub(crate) fn set_domain_matcher(&mut self, role_definition: &str, matcher: DomainMatcher) -> Result<()> {
        let role = self
            .roles
            .get_mut(role_definition)
            .ok_or_else(|| AuthzError::UnknownRoleDefinition(role_definition.to_string()))?;
        role.domain_matcher = matcher;
        for definition in &mut self.definition.roles {
            if definition.name == role_definition {
                definition.domain_matcher = matcher;
            }
        }
        Ok(())
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn request(&self) -> &FieldSet {
        &self.definition.request
    }

    pub fn policy(&self) -> &FieldSet {
        &self.definition.policy
    }

    pub fn effect(&self) -> Effect {
        self.definition.effect
    }

    pub fn matcher(&self) -> &Expr {
        &self.matcher
    }

    pub fn matcher_source(&self) -> &str {
        &self.definition.matcher
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.roles.values()
    }

    pub fn role_definition(&self, name: &str) -> Option<&RoleDefinition> {
        self.roles.get(name)
    }

    /// Whether the matcher must be evaluated once per policy row
    pub fn needs_policy(&self) -> bool {
        self.needs_policy
    }

    /// Position of the `eft` policy field, when the policy carries effects
    pub fn effect_index(&self) -> Option<usize> {
        self.effect_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_MODEL: &str = r#"
# scoped RBAC
[request_definition]
r = sub, dom, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub, r.dom) && \
    r.obj == p.obj && r.act == p.act
"#;

    #[test]
    fn test_parse_domain_model() {
        let model = Model::from_text(DOMAIN_MODEL).unwrap();
        assert_eq!(model.request().fields, vec!["sub", "dom", "obj", "act"]);
        assert_eq!(model.policy().fields, vec!["sub", "obj", "act"]);
        let g = model.role_definition("g").unwrap();
        assert!(g.has_domain());
        assert_eq!(g.domain_matcher, DomainMatcher::Exact);
        assert_eq!(model.effect(), Effect::AllowOverride);
        assert!(model.needs_policy());
        assert_eq!(model.effect_index(), None);
        assert!(model.matcher_source().contains("r.obj == p.obj"));
    }

    #[test]
    fn test_optional_sections_default() {
        let model = Model::from_text(
            "[request_definition]\nr = sub, obj\n[policy_definition]\np = sub, obj\n[matchers]\nm = r.sub == p.sub && r.obj == p.obj\n",
        )
        .unwrap();
        assert_eq!(model.roles().count(), 0);
        assert_eq!(model.effect(), Effect::AllowOverride);
    }

    #[test]
    fn test_deny_override_effect() {
        let model = Model::from_text(
            "[request_definition]\nr = sub, obj, act\n[policy_definition]\np = sub, obj, act, eft\n[policy_effect]\ne = !some(where (p.eft == deny))\n[matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n",
        )
        .unwrap();
        assert_eq!(model.effect(), Effect::DenyOverride);
        assert_eq!(model.effect_index(), Some(3));
    }

    #[test]
    fn test_missing_and_duplicate_sections() {
        let missing = "[request_definition]\nr = sub\n[matchers]\nm = r.sub == \"a\"\n";
        assert!(matches!(Model::from_text(missing), Err(AuthzError::ModelSyntax(_))));

        let duplicate = "[request_definition]\nr = sub\n[request_definition]\nr = sub\n";
        assert!(matches!(Model::from_text(duplicate), Err(AuthzError::ModelSyntax(_))));

        let unknown = "[request_definition]\nr = sub\n[policy_definition]\np = sub\n[extras]\nx = 1\n[matchers]\nm = r.sub == p.sub\n";
        assert!(matches!(Model::from_text(unknown), Err(AuthzError::ModelSyntax(_))));

        let orphan = "r = sub\n";
        assert!(matches!(Model::from_text(orphan), Err(AuthzError::ModelSyntax(_))));
    }

    #[test]
    fn test_bad_definitions() {
        let wide_role = "[request_definition]\nr = sub\n[policy_definition]\np = sub\n[role_definition]\ng = _, _, _, _\n[matchers]\nm = r.sub == p.sub\n";
        assert!(matches!(Model::from_text(wide_role), Err(AuthzError::ModelSyntax(_))));

        let duplicate_field = "[request_definition]\nr = sub, sub\n[policy_definition]\np = sub\n[matchers]\nm = r.sub == p.sub\n";
        assert!(matches!(Model::from_text(duplicate_field), Err(AuthzError::ModelSyntax(_))));

        let bad_effect = "[request_definition]\nr = sub\n[policy_definition]\np = sub\n[policy_effect]\ne = priority(p.eft)\n[matchers]\nm = r.sub == p.sub\n";
        assert!(matches!(Model::from_text(bad_effect), Err(AuthzError::ModelSyntax(_))));
    }

    #[test]
    fn test_unknown_field_in_matcher() {
        let text = "[request_definition]\nr = sub, obj\n[policy_definition]\np = sub, obj\n[matchers]\nm = r.sub == p.sub && r.act == p.obj\n";
        assert!(matches!(Model::from_text(text), Err(AuthzError::UnknownField { .. })));
    }

    #[test]
    fn test_structured_model_round_trip_through_json() {
        let model = Model::from_text(DOMAIN_MODEL)
            .unwrap()
            .with_domain_matcher("g", DomainMatcher::hierarchical())
            .unwrap();
        let json = serde_json::to_string(model.definition()).unwrap();
        assert!(json.contains("\"domain_matcher\":\"prefix\""));

        let reloaded = Model::from_json(&json).unwrap();
        assert_eq!(
            reloaded.role_definition("g").unwrap().domain_matcher,
            DomainMatcher::hierarchical()
        );
    }

    #[test]
    fn test_domain_matcher_for_unknown_role() {
        let err = Model::from_text(DOMAIN_MODEL)
            .unwrap()
            .with_domain_matcher("g9", DomainMatcher::hierarchical())
            .unwrap_err();
        assert!(matches!(err, AuthzError::UnknownRoleDefinition(_)));
    }
}
