use crate::{
    expr::Expr,
    model::{Effect, Model},
    models::{Decision, PolicyRule},
    role_graph::RoleManager,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value<'a> {
    Str(&'a str),
    Bool(bool),
}

impl Value<'_> {
    fn truthy(self) -> bool {
        matches!(self, Value::Bool(true))
    }

    fn text(&self) -> &str {
        match self {
            Value::Str(s) => s,
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
        }
    }
}

/// Evaluates a compiled model's matcher for concrete requests.
///
/// Evaluation cannot fail: the matcher was type-checked at compile time and
/// request arity is checked by the caller, so a missing value reads as the
/// empty string and simply fails to match.
pub struct MatcherEvaluator<'a> {
    model: &'a Model,
    roles: &'a RoleManager,
}

impl<'a> MatcherEvaluator<'a> {
    pub fn new(model: &'a Model, roles: &'a RoleManager) -> Self {
        Self { model, roles }
    }

    /// Whether the matcher holds for `request` against one policy row
    pub fn matches(&self, request: &[&str], policy: Option<&PolicyRule>) -> bool {
        self.eval(self.model.matcher(), request, policy).truthy()
    }

    /// Score every candidate row and aggregate by the model's effect
    pub fn decide<'r, I>(&self, request: &[&str], candidates: I) -> Decision
    where
        I: IntoIterator<Item = &'r PolicyRule>,
    {
        if !self.model.needs_policy() {
            let allowed = self.matches(request, None);
            debug!(allowed, "Matcher evaluated without policy rows");
            return Decision { allowed, rule: None };
        }

        let effect = self.model.effect();
        let mut allowed_by = None;
        for rule in candidates {
            if !self.matches(request, Some(rule)) {
                continue;
            }
            match (effect, self.is_deny(rule)) {
                (Effect::AllowOverride, false) => {
                    debug!(%rule, "Allowed by policy");
                    return Decision {
                        allowed: true,
                        rule: Some(rule.clone()),
                    };
                }
                (Effect::DenyOverride, true) => {
                    debug!(%rule, "Denied by policy");
                    return Decision {
                        allowed: false,
                        rule: Some(rule.clone()),
                    };
                }
                (Effect::DenyOverride, false) if allowed_by.is_none() => {
                    allowed_by = Some(rule.clone());
                }
                _ => {}
            }
        }

        // deny-override still needs a matching allow row
        match allowed_by {
            Some(rule) => {
                debug!(%rule, "Allowed by policy, no deny matched");
                Decision {
                    allowed: true,
                    rule: Some(rule),
                }
            }
            None => Decision::deny(),
        }
    }

    fn is_deny(&self, rule: &PolicyRule) -> bool {
        self.model
            .effect_index()
            .and_then(|index| rule.get(index))
            .is_some_and(|eft| eft == "deny")
    }

    fn eval<'v>(&self, expr: &'v Expr, request: &[&'v str], policy: Option<&'v PolicyRule>) -> Value<'v> {
        match expr {
            Expr::Str(s) => Value::Str(s),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Request(index) => Value::Str(request.get(*index).copied().unwrap_or_default()),
            Expr::Policy(index) => Value::Str(policy.and_then(|rule| rule.get(*index)).unwrap_or_default()),
            Expr::Eq(l, r) => Value::Bool(self.eval(l, request, policy) == self.eval(r, request, policy)),
            Expr::Ne(l, r) => Value::Bool(self.eval(l, request, policy) != self.eval(r, request, policy)),
            Expr::And(l, r) => Value::Bool(
                self.eval(l, request, policy).truthy() && self.eval(r, request, policy).truthy(),
            ),
            Expr::Or(l, r) => Value::Bool(
                self.eval(l, request, policy).truthy() || self.eval(r, request, policy).truthy(),
            ),
            Expr::Not(inner) => Value::Bool(!self.eval(inner, request, policy).truthy()),
            Expr::Predicate { func, left, right } => {
                let left = self.eval(left, request, policy);
                let right = self.eval(right, request, policy);
                Value::Bool(func.apply(left.text(), right.text()))
            }
            Expr::HasRole {
                definition,
                subject,
                role,
                domain,
            } => {
                let subject = self.eval(subject, request, policy);
                let role = self.eval(role, request, policy);
                let domain = domain.as_ref().map(|d| self.eval(d, request, policy));
                Value::Bool(self.roles.has_role(
                    definition,
                    subject.text(),
                    role.text(),
                    domain.as_ref().map(Value::text),
                ))
            }
        }
    }
}
