use crate::{
    domain::DomainMatcher,
    error::{AuthzError, Result},
    model::{Model, RoleDefinition},
    models::RoleTuple,
};
use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default bound on the number of inheritance hops followed
pub const DEFAULT_MAX_HIERARCHY_DEPTH: usize = 10;

/// Cached closures kept per graph before the cache is cleared
pub const CLOSURE_CACHE_CAPACITY: usize = 4096;

type ClosureKey = (String, Option<String>);

/// Inheritance graph for one role definition.
///
/// Nodes are subjects and roles (a role is itself a subject for the next
/// hop); an edge `subject -> role` carries the domain of the assignment, or
/// `None` for a global grant.
pub struct RoleGraph {
    name: String,
    matcher: DomainMatcher,
    max_depth: usize,
    graph: StableDiGraph<String, Option<String>>,
    nodes: AHashMap<String, NodeIndex>,
    /// Transitive closures per (subject, query domain)
    cache: Option<DashMap<ClosureKey, Arc<AHashSet<String>>>>,
    cache_capacity: usize,
}

impl RoleGraph {
    pub fn new(definition: &RoleDefinition, max_depth: usize, cache_enabled: bool) -> Self {
        Self {
            name: definition.name.clone(),
            matcher: definition.domain_matcher,
            max_depth,
            graph: StableDiGraph::default(),
            nodes: AHashMap::new(),
            cache: cache_enabled.then(DashMap::new),
            cache_capacity: CLOSURE_CACHE_CAPACITY,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain_matcher(&self) -> DomainMatcher {
        self.matcher
    }

    pub fn set_domain_matcher(&mut self, matcher: DomainMatcher) {
        self.matcher = matcher;
        self.invalidate();
    }

    /// Drop every cached closure
    pub fn invalidate(&self) {
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
    }

    /// Number of closures currently cached
    pub fn cached_closures(&self) -> usize {
        self.cache.as_ref().map_or(0, DashMap::len)
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn add_link(&mut self, tuple: &RoleTuple) {
        let from = self.node(&tuple.subject);
        let to = self.node(&tuple.role);
        self.graph.add_edge(from, to, tuple.domain.clone());
        self.invalidate();
    }

    /// Remove every edge equal to `tuple`; returns how many were removed
    pub fn remove_link(&mut self, tuple: &RoleTuple) -> usize {
        let (Some(&from), Some(&to)) = (self.nodes.get(&tuple.subject), self.nodes.get(&tuple.role)) else {
            return 0;
        };

        let doomed: Vec<EdgeIndex> = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .filter(|edge| edge.target() == to && *edge.weight() == tuple.domain)
            .map(|edge| edge.id())
            .collect();
        for edge in &doomed {
            self.graph.remove_edge(*edge);
        }

        self.prune(from);
        self.prune(to);
        self.invalidate();
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.nodes.clear();
        self.invalidate();
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.nodes.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.nodes.insert(name.to_string(), index);
        index
    }

    fn prune(&mut self, index: NodeIndex) {
        let isolated = self.graph.edges_directed(index, Direction::Outgoing).next().is_none()
            && self.graph.edges_directed(index, Direction::Incoming).next().is_none();
        if isolated {
            if let Some(name) = self.graph.remove_node(index) {
                self.nodes.remove(&name);
            }
        }
    }

    fn compatible(&self, granted: Option<&str>, query: Option<&str>) -> bool {
        match (granted, query) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(granted), Some(query)) => self.matcher.matches(query, granted),
        }
    }

    /// Whether `subject` holds `role` in `domain`, directly or transitively.
    /// A name always holds itself.
    pub fn has_role(&self, subject: &str, role: &str, domain: Option<&str>) -> bool {
        if subject == role {
            return true;
        }
        self.closure(subject, domain).contains(role)
    }

    /// Full transitive closure of roles held by `subject` in `domain`
    pub fn effective_roles(&self, subject: &str, domain: Option<&str>) -> BTreeSet<String> {
        self.closure(subject, domain).iter().cloned().collect()
    }

    /// Roles assigned to `subject` by a single edge compatible with `domain`
    pub fn direct_roles(&self, subject: &str, domain: Option<&str>) -> BTreeSet<String> {
        self.neighbours(subject, domain, Direction::Outgoing)
    }

    /// Subjects assigned `role` by a single edge compatible with `domain`
    pub fn subjects_with_role(&self, role: &str, domain: Option<&str>) -> BTreeSet<String> {
        self.neighbours(role, domain, Direction::Incoming)
    }

    /// Every edge, as role tuples
    pub fn links(&self) -> Vec<RoleTuple> {
        self.graph
            .edge_references()
            .filter_map(|edge| {
                let subject = self.graph.node_weight(edge.source())?;
                let role = self.graph.node_weight(edge.target())?;
                Some(RoleTuple {
                    subject: subject.clone(),
                    role: role.clone(),
                    domain: edge.weight().clone(),
                })
            })
            .collect()
    }

    fn neighbours(&self, name: &str, domain: Option<&str>, direction: Direction) -> BTreeSet<String> {
        let Some(&index) = self.nodes.get(name) else {
            return BTreeSet::new();
        };
        self.graph
            .edges_directed(index, direction)
            .filter(|edge| self.compatible(edge.weight().as_deref(), domain))
            .filter_map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                self.graph.node_weight(other).cloned()
            })
            .collect()
    }

    fn closure(&self, subject: &str, domain: Option<&str>) -> Arc<AHashSet<String>> {
        let Some(ref cache) = self.cache else {
            return Arc::new(self.compute_closure(subject, domain));
        };
        // names absent from the graph hold nothing and are never cached
        if !self.nodes.contains_key(subject) {
            return Arc::new(AHashSet::new());
        }

        let key = (subject.to_string(), domain.map(str::to_string));
        if let Some(hit) = cache.get(&key) {
            return Arc::clone(hit.value());
        }
        let roles = Arc::new(self.compute_closure(subject, domain));
        if cache.len() >= self.cache_capacity {
            debug!(graph = %self.name, capacity = self.cache_capacity, "Closure cache full; clearing");
            cache.clear();
        }
        cache.insert(key, Arc::clone(&roles));
        roles
    }

    /// Breadth-first walk from `subject` over compatible edges. A visited set
    /// makes cyclic assignments terminate; the depth bound stops runaway
    /// hierarchies.
    fn compute_closure(&self, subject: &str, domain: Option<&str>) -> AHashSet<String> {
        let mut roles = AHashSet::new();
        let Some(&start) = self.nodes.get(subject) else {
            return roles;
        };

        let mut visited = AHashSet::new();
        visited.insert(start);
        let mut frontier = vec![start];
        let mut depth = 0;

        while !frontier.is_empty() {
            if depth >= self.max_depth {
                warn!(
                    graph = %self.name,
                    subject,
                    max_depth = self.max_depth,
                    "Role hierarchy deeper than the configured limit; traversal truncated"
                );
                break;
            }

            let mut next = Vec::new();
            for node in frontier {
                for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                    if !self.compatible(edge.weight().as_deref(), domain) {
                        continue;
                    }
                    let target = edge.target();
                    if !visited.insert(target) {
                        continue;
                    }
                    if let Some(role) = self.graph.node_weight(target) {
                        roles.insert(role.clone());
                    }
                    next.push(target);
                }
            }
            frontier = next;
            depth += 1;
        }

        debug!(graph = %self.name, subject, ?domain, roles = roles.len(), "Resolved role closure");
        roles
    }
}

/// All role graphs of a model, keyed by role definition name
pub struct RoleManager {
    graphs: BTreeMap<String, RoleGraph>,
}

impl RoleManager {
    pub fn new(model: &Model, max_depth: usize, cache_enabled: bool) -> Self {
        let graphs = model
            .roles()
            .map(|definition| {
                (
                    definition.name.clone(),
                    RoleGraph::new(definition, max_depth, cache_enabled),
                )
            })
            .collect();
        Self { graphs }
    }

    pub fn graph(&self, name: &str) -> Result<&RoleGraph> {
        self.graphs
            .get(name)
            .ok_or_else(|| AuthzError::UnknownRoleDefinition(name.to_string()))
    }

    pub fn graph_mut(&mut self, name: &str) -> Result<&mut RoleGraph> {
        self.graphs
            .get_mut(name)
            .ok_or_else(|| AuthzError::UnknownRoleDefinition(name.to_string()))
    }

    /// Role lookup used by matchers; an unknown definition never grants
    pub fn has_role(&self, name: &str, subject: &str, role: &str, domain: Option<&str>) -> bool {
        self.graphs
            .get(name)
            .is_some_and(|graph| graph.has_role(subject, role, domain))
    }

    pub fn graphs(&self) -> impl Iterator<Item = &RoleGraph> {
        self.graphs.values()
    }

    pub fn clear(&mut self) {
        for graph in self.graphs.values_mut() {
            graph.clear();
        }
    }
}
