use crate::{
    adapter::PolicyAdapter,
    config::EngineConfig,
    domain::DomainMatcher,
    error::{AuthzError, Result},
    eval::MatcherEvaluator,
    model::Model,
    models::*,
    role_graph::RoleManager,
    store::{Entry, RelationshipStore},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Role definition used by the convenience role queries
pub const DEFAULT_ROLE_DEFINITION: &str = "g";

const SUBJECT_FIELD: &str = "sub";
const DOMAIN_FIELD: &str = "dom";
const OBJECT_FIELD: &str = "obj";
const ACTION_FIELD: &str = "act";

/// Inverse query: which objects of a type may `subject` perform `action` on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListObjectsRequest {
    pub subject: String,
    pub action: String,
    pub object_type: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl ListObjectsRequest {
    pub fn new(subject: &str, action: &str, object_type: &str) -> Self {
        Self {
            subject: subject.to_string(),
            action: action.to_string(),
            object_type: object_type.to_string(),
            domain: None,
        }
    }

    pub fn in_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    fn covers(&self, object: &str) -> bool {
        object == self.object_type
            || object
                .strip_prefix(self.object_type.as_str())
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

/// Store and role graphs guarded together so readers never observe a
/// policy change without the matching role graph change
struct EngineState {
    store: RelationshipStore,
    roles: RoleManager,
}

impl EngineState {
    fn new(model: &Model, config: &EngineConfig) -> Self {
        Self {
            store: RelationshipStore::new(model),
            roles: RoleManager::new(model, config.max_hierarchy_depth, config.cache_roles),
        }
    }

    fn apply(&mut self, entry: &Entry, add: bool) -> usize {
        let removed = self.store.apply(entry, add);
        if let Entry::Role { definition, tuple } = entry {
            if let Ok(graph) = self.roles.graph_mut(definition) {
                if add {
                    graph.add_link(tuple);
                } else {
                    graph.remove_link(tuple);
                }
            }
        }
        removed
    }

    fn invalidate(&self) {
        for graph in self.roles.graphs() {
            graph.invalidate();
        }
    }
}

/// Scoped RBAC enforcer: compiled model, relationship store, role graphs
/// and an optional external adapter
pub struct Enforcer {
    model: Arc<Model>,
    config: EngineConfig,
    state: RwLock<EngineState>,
    adapter: Option<Arc<dyn PolicyAdapter>>,
    /// Serializes mutations across the adapter write and the in-memory apply
    write_gate: tokio::sync::Mutex<()>,
}

impl Enforcer {
    /// Create an empty enforcer; domain matchers from `config` are applied
    /// to the model's role definitions
    pub fn new(mut model: Model, config: EngineConfig) -> Result<Self> {
        for (definition, matcher) in &config.domain_matchers {
            model.set_domain_matcher(definition, *matcher)?;
        }
        let state = EngineState::new(&model, &config);

        info!(
            request = %model.request(),
            policy = %model.policy(),
            effect = ?model.effect(),
            "Enforcer created"
        );

        Ok(Self {
            model: Arc::new(model),
            config,
            state: RwLock::new(state),
            adapter: None,
            write_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Persist every mutation through `adapter` before applying it
    pub fn with_adapter(mut self, adapter: Arc<dyn PolicyAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Create an enforcer and load its initial rows from `adapter`
    pub async fn from_adapter(
        model: Model,
        config: EngineConfig,
        adapter: Arc<dyn PolicyAdapter>,
    ) -> Result<Self> {
        let enforcer = Self::new(model, config)?.with_adapter(adapter);
        enforcer.load_from_adapter().await?;
        Ok(enforcer)
    }

    /// Replace the in-memory state with the adapter's rows. Every row is
    /// validated first; a malformed row leaves the current state untouched.
    pub async fn load_from_adapter(&self) -> Result<usize> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| AuthzError::Adapter("no adapter configured".to_string()))?;

        let _gate = self.write_gate.lock().await;
        let rows = adapter.load().await?;

        let mut fresh = EngineState::new(&self.model, &self.config);
        let entries = rows
            .iter()
            .map(|row| fresh.store.resolve(row))
            .collect::<Result<Vec<_>>>()?;
        for entry in &entries {
            fresh.apply(entry, true);
        }

        let mut state = self.state.write();
        for object in state.store.known_objects() {
            fresh.store.add_known_object(object);
        }
        *state = fresh;

        info!("Loaded {} rows from adapter", entries.len());
        Ok(entries.len())
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the domain matcher for a role definition at runtime
    pub fn add_named_domain_matcher(&mut self, definition: &str, matcher: DomainMatcher) -> Result<()> {
        Arc::make_mut(&mut self.model).set_domain_matcher(definition, matcher)?;
        self.state.get_mut().roles.graph_mut(definition)?.set_domain_matcher(matcher);
        self.config.domain_matchers.insert(definition.to_string(), matcher);
        info!(definition, %matcher, "Registered domain matcher");
        Ok(())
    }

    // =============================================================================
    // Enforcement
    // =============================================================================

    fn check_request(&self, request: &[&str]) -> Result<()> {
        let expected = self.model.request().len();
        if request.len() != expected {
            return Err(AuthzError::InvalidRequest(format!(
                "request has {} values, model `{}` expects {}",
                request.len(),
                self.model.request(),
                expected
            )));
        }
        Ok(())
    }

    fn decide(&self, state: &EngineState, request: &[&str]) -> Decision {
        let decision = MatcherEvaluator::new(&self.model, &state.roles)
            .decide(request, state.store.all_policies());
        if self.config.log_decisions {
            debug!(?request, allowed = decision.allowed, "Enforced request");
        }
        decision
    }

    /// Decide a request. Unknown subjects, roles and domains simply deny;
    /// only a request with the wrong number of values is an error.
    pub fn enforce(&self, request: &[&str]) -> Result<bool> {
        Ok(self.enforce_ex(request)?.allowed)
    }

    /// Like [`enforce`](Self::enforce) but also reports the deciding rule
    pub fn enforce_ex(&self, request: &[&str]) -> Result<Decision> {
        self.check_request(request)?;
        let state = self.state.read();
        Ok(self.decide(&state, request))
    }

    pub fn batch_enforce(&self, requests: &[Vec<String>]) -> Result<Vec<bool>> {
        let requests: Vec<Vec<&str>> = requests
            .iter()
            .map(|values| values.iter().map(String::as_str).collect())
            .collect();
        for request in &requests {
            self.check_request(request)?;
        }

        let state = self.state.read();
        Ok(requests
            .iter()
            .map(|request| self.decide(&state, request).allowed)
            .collect())
    }

    // =============================================================================
    // Object listing
    // =============================================================================

    /// Register objects that exist without appearing in any policy row
    pub fn add_known_objects<I, S>(&self, objects: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.write();
        for object in objects {
            state.store.add_known_object(object.as_ref());
        }
    }

    /// Every known object of the requested type for which `enforce` allows
    /// the action.
    ///
    /// The universe is the policy `obj` column plus registered objects; each
    /// candidate is decided exactly like a single `enforce` call, so the
    /// cost grows with the number of known objects.
    pub fn list_objects(&self, query: &ListObjectsRequest) -> Result<BTreeSet<String>> {
        let request_fields = self.model.request();
        let mut template: Vec<Option<String>> = vec![None; request_fields.len()];
        let mut object_slot = None;

        for (index, field) in request_fields.fields.iter().enumerate() {
            let value = match field.as_str() {
                SUBJECT_FIELD => Some(query.subject.clone()),
                ACTION_FIELD => Some(query.action.clone()),
                DOMAIN_FIELD => Some(query.domain.clone().ok_or_else(|| {
                    AuthzError::InvalidRequest("model requires a domain for list_objects".to_string())
                })?),
                OBJECT_FIELD => {
                    object_slot = Some(index);
                    None
                }
                other => {
                    return Err(AuthzError::InvalidRequest(format!(
                        "list_objects cannot fill request field '{other}'"
                    )))
                }
            };
            if let Some(slot) = template.get_mut(index) {
                *slot = value;
            }
        }

        let object_slot = object_slot.ok_or_else(|| {
            AuthzError::InvalidRequest("model request has no `obj` field".to_string())
        })?;
        if query.domain.is_some() && request_fields.position(DOMAIN_FIELD).is_none() {
            return Err(AuthzError::InvalidRequest(
                "model request has no `dom` field".to_string(),
            ));
        }

        let state = self.state.read();
        let mut universe: BTreeSet<String> = state.store.known_objects().clone();
        if let Some(column) = self.model.policy().position(OBJECT_FIELD) {
            universe.extend(state.store.column_values(column));
        }

        let mut allowed = BTreeSet::new();
        for object in universe.into_iter().filter(|object| query.covers(object)) {
            let request: Vec<&str> = template
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    if index == object_slot {
                        object.as_str()
                    } else {
                        value.as_deref().unwrap_or_default()
                    }
                })
                .collect();
            if self.decide(&state, &request).allowed {
                allowed.insert(object.clone());
            }
        }

        debug!(
            subject = %query.subject,
            action = %query.action,
            object_type = %query.object_type,
            found = allowed.len(),
            "Listed objects"
        );
        Ok(allowed)
    }

    // =============================================================================
    // Role and permission queries
    // =============================================================================

    /// `subject` holds `role` in `domain` under the default role definition
    pub fn has_role(&self, subject: &str, role: &str, domain: Option<&str>) -> bool {
        self.state
            .read()
            .roles
            .has_role(DEFAULT_ROLE_DEFINITION, subject, role, domain)
    }

    pub fn has_named_role(
        &self,
        definition: &str,
        subject: &str,
        role: &str,
        domain: Option<&str>,
    ) -> Result<bool> {
        Ok(self.state.read().roles.graph(definition)?.has_role(subject, role, domain))
    }

    /// Roles assigned directly to `subject`
    pub fn roles_for(&self, subject: &str, domain: Option<&str>) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .read()
            .roles
            .graph(DEFAULT_ROLE_DEFINITION)?
            .direct_roles(subject, domain))
    }

    /// Every role `subject` holds, including inherited ones
    pub fn implicit_roles_for(&self, subject: &str, domain: Option<&str>) -> Result<BTreeSet<String>> {
        self.implicit_roles_in(DEFAULT_ROLE_DEFINITION, subject, domain)
    }

    pub fn implicit_roles_in(
        &self,
        definition: &str,
        subject: &str,
        domain: Option<&str>,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .read()
            .roles
            .graph(definition)?
            .effective_roles(subject, domain))
    }

    /// Subjects assigned `role` directly
    pub fn subjects_for_role(&self, role: &str, domain: Option<&str>) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .read()
            .roles
            .graph(DEFAULT_ROLE_DEFINITION)?
            .subjects_with_role(role, domain))
    }

    fn subject_index(&self) -> usize {
        self.model.policy().position(SUBJECT_FIELD).unwrap_or(0)
    }

    /// Policy rows naming `subject` directly
    pub fn permissions_for(&self, subject: &str) -> Vec<PolicyRule> {
        self.state.read().store.filter_policy(self.subject_index(), subject)
    }

    /// Policy rows naming `subject` or any role it holds in `domain`.
    /// When policies carry a `dom` field, rows outside `domain` are dropped.
    pub fn implicit_permissions_for(&self, subject: &str, domain: Option<&str>) -> Vec<PolicyRule> {
        let state = self.state.read();
        let mut subjects = vec![subject.to_string()];
        let mut matcher = DomainMatcher::Exact;
        if let Ok(graph) = state.roles.graph(DEFAULT_ROLE_DEFINITION) {
            subjects.extend(graph.effective_roles(subject, domain));
            matcher = graph.domain_matcher();
        }

        let subject_index = self.subject_index();
        let domain_index = self.model.policy().position(DOMAIN_FIELD);
        subjects
            .iter()
            .flat_map(|s| state.store.filter_policy(subject_index, s))
            .filter(|rule| match (domain, domain_index) {
                (Some(domain), Some(index)) => rule
                    .get(index)
                    .is_some_and(|granted| matcher.matches(domain, granted)),
                _ => true,
            })
            .collect()
    }

    pub fn filter_policy(&self, field_index: usize, value: &str) -> Vec<PolicyRule> {
        self.state.read().store.filter_policy(field_index, value)
    }

    pub fn all_policies(&self) -> Vec<PolicyRule> {
        self.state.read().store.all_policies().to_vec()
    }

    pub fn role_tuples(&self, definition: &str) -> Vec<RoleTuple> {
        self.state.read().store.role_tuples(definition).to_vec()
    }

    // =============================================================================
    // Mutations
    // =============================================================================

    pub async fn add_policy(&self, rule: PolicyRule) -> Result<()> {
        self.add_policies(vec![rule]).await
    }

    /// Add several rows; if any row is malformed or the adapter fails,
    /// none are added
    pub async fn add_policies(&self, rules: Vec<PolicyRule>) -> Result<()> {
        let key = self.model.policy().key.clone();
        let batch = rules
            .into_iter()
            .fold(WriteBatch::new(), |batch, rule| batch.add_policy(&key, rule));
        self.write(batch).await.map(|_| ())
    }

    /// Remove every row equal to `rule`; returns how many were removed
    pub async fn remove_policy(&self, rule: &PolicyRule) -> Result<usize> {
        let batch = WriteBatch::new().remove_policy(&self.model.policy().key, rule.clone());
        self.write(batch).await
    }

    /// Remove rows matching `values` from `field_index` on (empty = any)
    pub async fn remove_filtered_policy(&self, field_index: usize, values: &[&str]) -> Result<usize> {
        let key = self.model.policy().key.clone();
        let _gate = self.write_gate.lock().await;

        let doomed: BTreeSet<PolicyRule> = self
            .state
            .read()
            .store
            .filtered_policy(field_index, values)
            .into_iter()
            .collect();
        let batch = doomed
            .into_iter()
            .fold(WriteBatch::new(), |batch, rule| batch.remove_policy(&key, rule));
        self.write_locked(batch).await
    }

    pub async fn add_role_tuple(&self, definition: &str, tuple: RoleTuple) -> Result<()> {
        self.write(WriteBatch::new().add_role(definition, tuple)).await.map(|_| ())
    }

    /// Remove every copy of `tuple`; returns how many were removed
    pub async fn remove_role_tuple(&self, definition: &str, tuple: &RoleTuple) -> Result<usize> {
        self.write(WriteBatch::new().remove_role(definition, tuple.clone())).await
    }

    /// Apply a batch all-or-nothing: every row is validated, then the
    /// adapter (if any) persists the batch, then memory is updated.
    /// Returns the number of rows removed.
    pub async fn write(&self, batch: WriteBatch) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        self.write_locked(batch).await
    }

    async fn write_locked(&self, batch: WriteBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let (deletes, writes) = {
            let state = self.state.read();
            let deletes = batch
                .deletes
                .iter()
                .map(|row| state.store.resolve(row))
                .collect::<Result<Vec<_>>>()?;
            let writes = batch
                .writes
                .iter()
                .map(|row| state.store.resolve(row))
                .collect::<Result<Vec<_>>>()?;
            (deletes, writes)
        };

        if let Some(ref adapter) = self.adapter {
            adapter.write(&batch).await?;
        }

        let mut state = self.state.write();
        let mut removed = 0;
        for entry in &deletes {
            removed += state.apply(entry, false);
        }
        for entry in &writes {
            state.apply(entry, true);
        }
        state.invalidate();

        info!(
            writes = writes.len(),
            deletes = deletes.len(),
            removed,
            "Applied write batch"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryAdapter;
    use async_trait::async_trait;

    /// Loads nothing and refuses every write
    struct RejectingAdapter;

    #[async_trait]
    impl PolicyAdapter for RejectingAdapter {
        async fn load(&self) -> Result<Vec<StoredRule>> {
            Ok(Vec::new())
        }

        async fn write(&self, _batch: &WriteBatch) -> Result<()> {
            Err(AuthzError::Adapter("storage unavailable".to_string()))
        }
    }

    const DOMAIN_MODEL: &str = "[request_definition]\nr = sub, dom, obj, act\n[policy_definition]\np = sub, obj, act\n[role_definition]\ng = _, _, _\n[matchers]\nm = g(r.sub, p.sub, r.dom) && r.obj == p.obj && r.act == p.act\n";

    fn prefix_enforcer() -> Enforcer {
        let config = EngineConfig::default().with_domain_matcher("g", DomainMatcher::hierarchical());
        Enforcer::new(Model::from_text(DOMAIN_MODEL).unwrap(), config).unwrap()
    }

    #[tokio::test]
    async fn test_basic_enforce() {
        let enforcer = prefix_enforcer();
        let request = ["group:teamA", "org:acme/project:payments/component:billing", "component", "deploy"];

        // Initially no permission
        assert!(!enforcer.enforce(&request).unwrap());

        enforcer
            .add_policy(PolicyRule::new(["role:deployer", "component", "deploy"]))
            .await
            .unwrap();
        enforcer
            .add_role_tuple(
                "g",
                RoleTuple::in_domain("group:teamA", "role:deployer", "org:acme/project:payments"),
            )
            .await
            .unwrap();

        let decision = enforcer.enforce_ex(&request).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.rule, Some(PolicyRule::new(["role:deployer", "component", "deploy"])));
    }

    #[tokio::test]
    async fn test_deny_override_fails_closed() {
        let model = Model::from_text(
            "[request_definition]\nr = sub, obj, act\n[policy_definition]\np = sub, obj, act, eft\n[policy_effect]\ne = !some(where (p.eft == deny))\n[matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n",
        )
        .unwrap();
        let enforcer = Enforcer::new(model, EngineConfig::default()).unwrap();
        assert!(!enforcer.enforce(&["user:mallory", "vault", "open"]).unwrap());

        enforcer
            .add_policies(vec![
                PolicyRule::new(["user:alice", "vault", "open", "allow"]),
                PolicyRule::new(["user:bob", "vault", "open", "allow"]),
                PolicyRule::new(["user:bob", "vault", "open", "deny"]),
            ])
            .await
            .unwrap();
        assert!(enforcer.enforce(&["user:alice", "vault", "open"]).unwrap());
        assert!(!enforcer.enforce(&["user:bob", "vault", "open"]).unwrap());
        assert!(!enforcer.enforce(&["user:mallory", "vault", "open"]).unwrap());
    }

    #[tokio::test]
    async fn test_wrong_arity_is_rejected() {
        let enforcer = prefix_enforcer();
        assert!(matches!(
            enforcer.enforce(&["alice", "component", "deploy"]),
            Err(AuthzError::InvalidRequest(_))
        ));
        assert!(matches!(
            enforcer.add_policy(PolicyRule::new(["a", "b"])).await,
            Err(AuthzError::MalformedTuple(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let enforcer = prefix_enforcer();
        let result = enforcer
            .add_policies(vec![
                PolicyRule::new(["role:a", "component", "view"]),
                PolicyRule::new(["role:b", "component"]),
            ])
            .await;
        assert!(matches!(result, Err(AuthzError::MalformedTuple(_))));
        assert!(enforcer.all_policies().is_empty());
    }

    #[tokio::test]
    async fn test_failed_adapter_write_leaves_state_unchanged() {
        let enforcer = prefix_enforcer();
        let rule = PolicyRule::new(["role:viewer", "component", "view"]);
        let tuple = RoleTuple::in_domain("alice", "role:viewer", "org:acme");
        enforcer.add_policy(rule.clone()).await.unwrap();
        enforcer.add_role_tuple("g", tuple.clone()).await.unwrap();
        let request = ["alice", "org:acme/project:p", "component", "view"];
        assert!(enforcer.enforce(&request).unwrap());

        let enforcer = enforcer.with_adapter(Arc::new(RejectingAdapter));
        let batch = WriteBatch::new()
            .remove_policy("p", rule.clone())
            .remove_role("g", tuple.clone())
            .add_policy("p", PolicyRule::new(["role:viewer", "component", "deploy"]))
            .add_role("g", RoleTuple::in_domain("bob", "role:viewer", "org:acme"));
        assert!(matches!(enforcer.write(batch).await, Err(AuthzError::Adapter(_))));
        assert!(matches!(
            enforcer
                .add_policies(vec![PolicyRule::new(["role:a", "component", "view"])])
                .await,
            Err(AuthzError::Adapter(_))
        ));

        assert_eq!(enforcer.all_policies(), vec![rule]);
        assert_eq!(enforcer.role_tuples("g"), vec![tuple]);
        assert!(enforcer.enforce(&request).unwrap());
        assert!(!enforcer.enforce(&["bob", "org:acme", "component", "view"]).unwrap());
    }

    #[tokio::test]
    async fn test_adapter_receives_writes() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let enforcer = prefix_enforcer().with_adapter(adapter.clone());

        enforcer
            .add_role_tuple("g", RoleTuple::in_domain("alice", "admin", "org:acme"))
            .await
            .unwrap();
        assert_eq!(adapter.len(), 1);

        let reloaded = Enforcer::from_adapter(
            Model::from_text(DOMAIN_MODEL).unwrap(),
            EngineConfig::default(),
            adapter,
        )
        .await
        .unwrap();
        assert!(reloaded.has_role("alice", "admin", Some("org:acme")));
    }

    #[tokio::test]
    async fn test_remove_filtered_policy() {
        let enforcer = prefix_enforcer();
        enforcer
            .add_policies(vec![
                PolicyRule::new(["role:a", "component", "view"]),
                PolicyRule::new(["role:a", "component", "deploy"]),
                PolicyRule::new(["role:b", "component", "view"]),
            ])
            .await
            .unwrap();

        assert_eq!(enforcer.remove_filtered_policy(0, &["role:a"]).await.unwrap(), 2);
        assert_eq!(enforcer.all_policies(), vec![PolicyRule::new(["role:b", "component", "view"])]);
    }

    #[test]
    fn test_runtime_domain_matcher_registration() {
        let mut enforcer =
            Enforcer::new(Model::from_text(DOMAIN_MODEL).unwrap(), EngineConfig::default()).unwrap();
        assert!(enforcer
            .add_named_domain_matcher("g2", DomainMatcher::hierarchical())
            .is_err());
        enforcer
            .add_named_domain_matcher("g", DomainMatcher::hierarchical())
            .unwrap();
        assert_eq!(
            enforcer.model().role_definition("g").unwrap().domain_matcher,
            DomainMatcher::hierarchical()
        );
    }

    #[test]
    fn test_list_objects_request_validation() {
        let enforcer = prefix_enforcer();
        let query = ListObjectsRequest::new("alice", "deploy", "component");
        assert!(matches!(
            enforcer.list_objects(&query),
            Err(AuthzError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_object_type_coverage() {
        let query = ListObjectsRequest::new("alice", "view", "document");
        assert!(query.covers("document"));
        assert!(query.covers("document:doc1"));
        assert!(!query.covers("documents:doc1"));
        assert!(!query.covers("folder:doc1"));
    }
}
