//! Property tests for enforcement invariants
//!
//! - Default deny when nothing is stored
//! - Duplicate rows never change decisions
//! - Prefix domains cover descendants and nothing else
//! - Object listing equals repeated single checks
//! - Inherited roles are visible through `has_role`

use authz_engine::*;
use proptest::prelude::*;

const SCOPED_MODEL: &str = "[request_definition]\nr = sub, dom, obj, act\n[policy_definition]\np = sub, obj, act\n[role_definition]\ng = _, _, _\n[matchers]\nm = g(r.sub, p.sub, r.dom) && r.obj == p.obj && r.act == p.act\n";

const ACL_MODEL: &str = "[request_definition]\nr = sub, obj, act\n[policy_definition]\np = sub, obj, act\n[role_definition]\ng = _, _\n[matchers]\nm = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act\n";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn scoped() -> Enforcer {
    let config = EngineConfig::default().with_domain_matcher("g", DomainMatcher::hierarchical());
    Enforcer::new(Model::from_text(SCOPED_MODEL).unwrap(), config).unwrap()
}

fn acl() -> Enforcer {
    Enforcer::new(Model::from_text(ACL_MODEL).unwrap(), EngineConfig::default()).unwrap()
}

fn name() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

fn segments() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,4}:[a-z]{1,4}", 1..4)
}

fn rule() -> impl Strategy<Value = (String, String, String)> {
    (
        prop::sample::select(vec!["user:alice", "user:bob", "role:reader", "role:writer"]),
        prop::sample::select(vec!["doc:1", "doc:2", "doc:3", "folder:1"]),
        prop::sample::select(vec!["read", "write"]),
    )
        .prop_map(|(s, o, a)| (s.to_string(), o.to_string(), a.to_string()))
}

proptest! {
    #[test]
    fn prop_empty_store_denies(sub in name(), dom in name(), obj in name(), act in name()) {
        let enforcer = scoped();
        prop_assert!(!enforcer.enforce(&[sub.as_str(), dom.as_str(), obj.as_str(), act.as_str()]).unwrap());
    }

    #[test]
    fn prop_duplicate_rows_do_not_change_decisions(
        rules in prop::collection::vec(rule(), 1..8),
        duplicate in 0usize..8,
        query in rule(),
    ) {
        let rt = runtime();
        let enforcer = acl();
        let policies: Vec<PolicyRule> = rules
            .iter()
            .map(|(s, o, a)| PolicyRule::new([s.as_str(), o.as_str(), a.as_str()]))
            .collect();
        rt.block_on(enforcer.add_policies(policies.clone())).unwrap();
        rt.block_on(enforcer.add_role_tuple("g", RoleTuple::new("user:alice", "role:reader"))).unwrap();

        let request = [query.0.as_str(), query.1.as_str(), query.2.as_str()];
        let before = enforcer.enforce(&request).unwrap();

        let again = policies[duplicate % policies.len()].clone();
        rt.block_on(enforcer.add_policy(again)).unwrap();
        prop_assert_eq!(enforcer.enforce(&request).unwrap(), before);
    }

    #[test]
    fn prop_prefix_domain_covers_descendants(
        granted in segments(),
        tail in segments(),
        sibling in "[a-z]{1,4}:[a-z]{1,4}",
    ) {
        let matcher = DomainMatcher::hierarchical();
        let granted = granted.join("/");
        let nested = format!("{granted}/{}", tail.join("/"));

        prop_assert!(matcher.matches(&granted, &granted));
        prop_assert!(matcher.matches(&nested, &granted));
        // extending the last segment is a different domain
        let extended = format!("{granted}x");
        prop_assert!(!matcher.matches(&extended, &granted));
        // a parent never satisfies a grant made below it
        prop_assert!(!matcher.matches(&granted, &nested));

        let rt = runtime();
        let enforcer = scoped();
        rt.block_on(enforcer.add_policy(PolicyRule::new(["role:r", "obj", "act"]))).unwrap();
        rt.block_on(enforcer.add_role_tuple("g", RoleTuple::in_domain("user:u", "role:r", &granted))).unwrap();
        prop_assert!(enforcer.enforce(&["user:u", nested.as_str(), "obj", "act"]).unwrap());

        let other = format!("{sibling}/other:zz");
        if !(other == granted || other.starts_with(&format!("{granted}/"))) {
            prop_assert!(!enforcer.enforce(&["user:u", other.as_str(), "obj", "act"]).unwrap());
        }
    }

    #[test]
    fn prop_list_objects_equals_enforce(
        rules in prop::collection::vec(rule(), 0..10),
        extra in prop::collection::vec("doc:[0-9]", 0..4),
        subject in prop::sample::select(vec!["user:alice", "user:bob", "user:carol"]),
        action in prop::sample::select(vec!["read", "write"]),
    ) {
        let rt = runtime();
        let enforcer = acl();
        let policies: Vec<PolicyRule> = rules
            .iter()
            .map(|(s, o, a)| PolicyRule::new([s.as_str(), o.as_str(), a.as_str()]))
            .collect();
        rt.block_on(enforcer.add_policies(policies)).unwrap();
        rt.block_on(enforcer.add_role_tuple("g", RoleTuple::new("user:bob", "role:writer"))).unwrap();
        rt.block_on(enforcer.add_role_tuple("g", RoleTuple::new("role:writer", "role:reader"))).unwrap();
        enforcer.add_known_objects(&extra);

        let listed = enforcer
            .list_objects(&ListObjectsRequest::new(subject, action, "doc"))
            .unwrap();

        let mut universe: Vec<String> = rules.iter().map(|(_, o, _)| o.clone()).collect();
        universe.extend(extra);
        for object in universe.iter().filter(|o| o.starts_with("doc:")) {
            let allowed = enforcer.enforce(&[subject, object.as_str(), action]).unwrap();
            prop_assert_eq!(listed.contains(object), allowed);
        }
        prop_assert!(listed.iter().all(|o| o.starts_with("doc:")));
    }

    #[test]
    fn prop_role_chain_is_transitive(chain in prop::collection::vec(name(), 2..8)) {
        let rt = runtime();
        let enforcer = scoped();
        for pair in chain.windows(2) {
            rt.block_on(enforcer.add_role_tuple("g", RoleTuple::in_domain(&pair[0], &pair[1], "org:acme"))).unwrap();
        }
        let first = &chain[0];
        let last = &chain[chain.len() - 1];
        prop_assert!(enforcer.has_role(first, last, Some("org:acme/project:p")));
        prop_assert!(enforcer.has_role(first, last, Some("org:acme")));
        // unrelated org never sees the chain unless the names loop back
        if first != last {
            prop_assert!(!enforcer.has_role(first, last, Some("org:other")));
        }
    }
}
