//! Matcher expression language.
//!
//! Supported syntax:
//! - Field references: `r.sub`, `p.obj` (the prefix is the request or policy key)
//! - Comparisons: `==`, `!=` (exact string or boolean equality)
//! - Boolean operators: `&&`, `||`, `!`
//! - Literals: `"strings"`, `true`, `false`
//! - Calls: role lookups `g(r.sub, p.sub)` / `g(r.sub, p.sub, r.dom)` and the
//!   built-in predicates `contains`, `startsWith`, `keyMatch`, `domainMatch`
//! - Parentheses for grouping
//!
//! Parsing produces an untyped [`RawExpr`]; [`compile`] resolves field names
//! to positions and type-checks the tree into an [`Expr`] that can be
//! evaluated without failing.

use crate::domain::DomainMatcher;
use crate::error::{AuthzError, Result};
use crate::model::{FieldSet, RoleDefinition};
use std::collections::BTreeMap;
use std::fmt;

// ─── Raw AST ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RawExpr {
    Str(String),
    Bool(bool),
    Path(Vec<String>),
    Call { name: String, args: Vec<RawExpr> },
    Not(Box<RawExpr>),
    Binary {
        op: BinOp,
        left: Box<RawExpr>,
        right: Box<RawExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    And,
    Or,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        };
        f.write_str(symbol)
    }
}

// ─── Compiled AST ───────────────────────────────────────────────────────

/// Built-in string predicates available to matchers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `contains(haystack, needle)`
    Contains,
    /// `startsWith(value, prefix)`
    StartsWith,
    /// `keyMatch(key, pattern)`: a `*` in the pattern matches any suffix
    KeyMatch,
    /// `domainMatch(request_domain, granted_domain)`: hierarchical prefix
    DomainMatch,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "contains" => Some(Self::Contains),
            "startsWith" => Some(Self::StartsWith),
            "keyMatch" => Some(Self::KeyMatch),
            "domainMatch" => Some(Self::DomainMatch),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::KeyMatch => "keyMatch",
            Self::DomainMatch => "domainMatch",
        }
    }

    pub fn apply(&self, left: &str, right: &str) -> bool {
        match self {
            Self::Contains => left.contains(right),
            Self::StartsWith => left.starts_with(right),
            Self::KeyMatch => key_match(left, right),
            Self::DomainMatch => DomainMatcher::hierarchical().matches(left, right),
        }
    }
}

fn key_match(key: &str, pattern: &str) -> bool {
    match pattern.find('*') {
        None => key == pattern,
        Some(star) => match (key.get(..star), pattern.get(..star)) {
            (Some(head), Some(prefix)) => head == prefix,
            _ => false,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Bool(bool),
    /// Value of the request field at this position
    Request(usize),
    /// Value of the policy field at this position
    Policy(usize),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Predicate {
        func: Builtin,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Role membership lookup against the named role definition
    HasRole {
        definition: String,
        subject: Box<Expr>,
        role: Box<Expr>,
        domain: Option<Box<Expr>>,
    },
}

impl Expr {
    /// Whether evaluating this expression needs a policy row
    pub fn references_policy(&self) -> bool {
        match self {
            Self::Policy(_) => true,
            Self::Str(_) | Self::Bool(_) | Self::Request(_) => false,
            Self::Not(inner) => inner.references_policy(),
            Self::Eq(l, r) | Self::Ne(l, r) | Self::And(l, r) | Self::Or(l, r) => {
                l.references_policy() || r.references_policy()
            }
            Self::Predicate { left, right, .. } => {
                left.references_policy() || right.references_policy()
            }
            Self::HasRole {
                subject,
                role,
                domain,
                ..
            } => {
                subject.references_policy()
                    || role.references_policy()
                    || domain.as_ref().is_some_and(|d| d.references_policy())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Str,
    Bool,
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str => f.write_str("string"),
            Self::Bool => f.write_str("boolean"),
        }
    }
}

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
    Not, // !
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {}
            '.' => tokens.push(Token::Dot),
            ',' => tokens.push(Token::Comma),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '=' if chars.peek() == Some(&'=') => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' if chars.peek() == Some(&'=') => {
                chars.next();
                tokens.push(Token::Ne);
            }
            '!' => tokens.push(Token::Not),
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                tokens.push(Token::Or);
            }
            '"' => {
                let mut literal = String::new();
                let mut terminated = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '"' => {
                            terminated = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some(escaped) => literal.push(escaped),
                            None => break,
                        },
                        other => literal.push(other),
                    }
                }
                if !terminated {
                    return Err(AuthzError::syntax("unterminated string literal in matcher"));
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(AuthzError::syntax(format!(
                    "unexpected character `{other}` in matcher"
                )));
            }
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        match self.advance() {
            Some(ref tok) if *tok == expected => Ok(()),
            other => Err(AuthzError::syntax(format!(
                "expected {what}, found {}",
                describe(other.as_ref())
            ))),
        }
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<RawExpr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = RawExpr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<RawExpr> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = RawExpr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// comparison = unary (("==" | "!=") unary)?
    fn parse_comparison(&mut self) -> Result<RawExpr> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(RawExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// unary = "!" unary | primary
    fn parse_unary(&mut self) -> Result<RawExpr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(RawExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    /// primary = literal | call | path | "(" or_expr ")"
    fn parse_primary(&mut self) -> Result<RawExpr> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(RawExpr::Str(s)),
            Some(Token::True) => Ok(RawExpr::Bool(true)),
            Some(Token::False) => Ok(RawExpr::Bool(false)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    return Ok(RawExpr::Call { name, args });
                }
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        other => {
                            return Err(AuthzError::syntax(format!(
                                "expected identifier after `.`, found {}",
                                describe(other.as_ref())
                            )));
                        }
                    }
                }
                Ok(RawExpr::Path(path))
            }
            other => Err(AuthzError::syntax(format!(
                "unexpected {} in matcher",
                describe(other.as_ref())
            ))),
        }
    }

    /// args = ")" | or_expr ("," or_expr)* ")"
    fn parse_args(&mut self) -> Result<Vec<RawExpr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => {
                    return Err(AuthzError::syntax(format!(
                        "expected `,` or `)` in call, found {}",
                        describe(other.as_ref())
                    )));
                }
            }
        }
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of expression".to_string(),
        Some(tok) => format!("{tok:?}"),
    }
}

/// Parse a matcher string into an untyped AST.
pub fn parse_matcher(input: &str) -> Result<RawExpr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(AuthzError::syntax("empty matcher expression"));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    if let Some(trailing) = parser.peek() {
        return Err(AuthzError::syntax(format!(
            "unexpected trailing token in matcher: {trailing:?}"
        )));
    }
    Ok(expr)
}

// ─── Compiler ───────────────────────────────────────────────────────────

/// Names visible to a matcher while it is compiled
pub struct CompileScope<'a> {
    pub request: &'a FieldSet,
    pub policy: &'a FieldSet,
    pub roles: &'a BTreeMap<String, RoleDefinition>,
}

/// Resolve and type-check a parsed matcher. The result must be boolean.
pub fn compile(raw: &RawExpr, scope: &CompileScope<'_>) -> Result<Expr> {
    let (expr, ty) = compile_node(raw, scope)?;
    if ty != Ty::Bool {
        return Err(AuthzError::syntax(format!(
            "matcher must be a boolean expression, found {ty}"
        )));
    }
    Ok(expr)
}

fn compile_node(raw: &RawExpr, scope: &CompileScope<'_>) -> Result<(Expr, Ty)> {
    match raw {
        RawExpr::Str(s) => Ok((Expr::Str(s.clone()), Ty::Str)),
        RawExpr::Bool(b) => Ok((Expr::Bool(*b), Ty::Bool)),
        RawExpr::Path(path) => compile_path(path, scope),
        RawExpr::Not(inner) => {
            let inner = expect_type(inner, Ty::Bool, "operand of `!`", scope)?;
            Ok((Expr::Not(Box::new(inner)), Ty::Bool))
        }
        RawExpr::Binary { op, left, right } => match op {
            BinOp::And | BinOp::Or => {
                let l = expect_type(left, Ty::Bool, "operand of boolean operator", scope)?;
                let r = expect_type(right, Ty::Bool, "operand of boolean operator", scope)?;
                let expr = if *op == BinOp::And {
                    Expr::And(Box::new(l), Box::new(r))
                } else {
                    Expr::Or(Box::new(l), Box::new(r))
                };
                Ok((expr, Ty::Bool))
            }
            BinOp::Eq | BinOp::Ne => {
                let (l, lt) = compile_node(left, scope)?;
                let (r, rt) = compile_node(right, scope)?;
                if lt != rt {
                    return Err(AuthzError::syntax(format!(
                        "cannot compare {lt} with {rt} using `{op}`"
                    )));
                }
                let expr = if *op == BinOp::Eq {
                    Expr::Eq(Box::new(l), Box::new(r))
                } else {
                    Expr::Ne(Box::new(l), Box::new(r))
                };
                Ok((expr, Ty::Bool))
            }
        },
        RawExpr::Call { name, args } => compile_call(name, args, scope),
    }
}

fn expect_type(raw: &RawExpr, want: Ty, what: &str, scope: &CompileScope<'_>) -> Result<Expr> {
    let (expr, ty) = compile_node(raw, scope)?;
    if ty != want {
        return Err(AuthzError::syntax(format!(
            "{what} must be {want}, found {ty}"
        )));
    }
    Ok(expr)
}

fn compile_path(path: &[String], scope: &CompileScope<'_>) -> Result<(Expr, Ty)> {
    match path {
        [key, field] if *key == scope.request.key => {
            let index = scope
                .request
                .position(field)
                .ok_or_else(|| AuthzError::unknown_field(format!("{key}.{field}"), "request_definition"))?;
            Ok((Expr::Request(index), Ty::Str))
        }
        [key, field] if *key == scope.policy.key => {
            let index = scope
                .policy
                .position(field)
                .ok_or_else(|| AuthzError::unknown_field(format!("{key}.{field}"), "policy_definition"))?;
            Ok((Expr::Policy(index), Ty::Str))
        }
        _ => Err(AuthzError::syntax(format!(
            "unknown identifier `{}` in matcher",
            path.join(".")
        ))),
    }
}

fn compile_call(name: &str, args: &[RawExpr], scope: &CompileScope<'_>) -> Result<(Expr, Ty)> {
    let mut compiled = Vec::with_capacity(args.len());
    for arg in args {
        compiled.push(expect_type(
            arg,
            Ty::Str,
            &format!("argument of `{name}`"),
            scope,
        )?);
    }

    if let Some(definition) = scope.roles.get(name) {
        let mut it = compiled.into_iter();
        return match (it.next(), it.next(), it.next(), it.next()) {
            (Some(subject), Some(role), None, None) => Ok((
                Expr::HasRole {
                    definition: name.to_string(),
                    subject: Box::new(subject),
                    role: Box::new(role),
                    domain: None,
                },
                Ty::Bool,
            )),
            (Some(subject), Some(role), Some(domain), None) if definition.has_domain() => Ok((
                Expr::HasRole {
                    definition: name.to_string(),
                    subject: Box::new(subject),
                    role: Box::new(role),
                    domain: Some(Box::new(domain)),
                },
                Ty::Bool,
            )),
            _ => Err(AuthzError::syntax(format!(
                "role function `{name}` takes {} arguments, got {}",
                if definition.has_domain() { "2 or 3" } else { "2" },
                args.len()
            ))),
        };
    }

    let func = Builtin::from_name(name)
        .ok_or_else(|| AuthzError::syntax(format!("unknown function `{name}` in matcher")))?;
    let mut it = compiled.into_iter();
    match (it.next(), it.next(), it.next()) {
        (Some(left), Some(right), None) => Ok((
            Expr::Predicate {
                func,
                left: Box::new(left),
                right: Box::new(right),
            },
            Ty::Bool,
        )),
        _ => Err(AuthzError::syntax(format!(
            "`{}` takes 2 arguments, got {}",
            func.name(),
            args.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_fixture() -> (FieldSet, FieldSet, BTreeMap<String, RoleDefinition>) {
        let request = FieldSet::new("r", ["sub", "dom", "obj", "act"]).unwrap();
        let policy = FieldSet::new("p", ["sub", "obj", "act"]).unwrap();
        let mut roles = BTreeMap::new();
        roles.insert("g".to_string(), RoleDefinition::new("g", 3).unwrap());
        roles.insert("g2".to_string(), RoleDefinition::new("g2", 2).unwrap());
        (request, policy, roles)
    }

    fn compile_str(input: &str) -> Result<Expr> {
        let (request, policy, roles) = scope_fixture();
        let scope = CompileScope {
            request: &request,
            policy: &policy,
            roles: &roles,
        };
        compile(&parse_matcher(input)?, &scope)
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse_matcher("a.x == b.y || c.z == \"v\" && !d.w").unwrap();
        match expr {
            RawExpr::Binary { op: BinOp::Or, right, .. } => match *right {
                RawExpr::Binary { op: BinOp::And, .. } => {}
                other => panic!("expected And on the right, got {other:?}"),
            },
            other => panic!("expected Or at the root, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_call_and_parentheses() {
        let expr = parse_matcher("(g(r.sub, p.sub, r.dom))").unwrap();
        match expr {
            RawExpr::Call { name, args } => {
                assert_eq!(name, "g");
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_matcher("").is_err());
        assert!(parse_matcher("r.sub == \"open").is_err());
        assert!(parse_matcher("r.sub == p.sub)").is_err());
        assert!(parse_matcher("r.sub === p.sub").is_err());
        assert!(parse_matcher("g(r.sub,").is_err());
        assert!(parse_matcher("r.sub # p.sub").is_err());
    }

    #[test]
    fn test_compile_resolves_positions() {
        let expr = compile_str("g(r.sub, p.sub, r.dom) && r.obj == p.obj").unwrap();
        match expr {
            Expr::And(left, right) => {
                assert!(matches!(*left, Expr::HasRole { ref definition, .. } if definition == "g"));
                assert_eq!(*right, Expr::Eq(Box::new(Expr::Request(2)), Box::new(Expr::Policy(1))));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_compile_unknown_field() {
        let err = compile_str("r.tenant == p.sub").unwrap_err();
        assert!(matches!(err, AuthzError::UnknownField { ref field, .. } if field == "r.tenant"));

        let err = compile_str("r.sub == p.dom").unwrap_err();
        assert!(matches!(err, AuthzError::UnknownField { ref section, .. } if section == "policy_definition"));
    }

    #[test]
    fn test_compile_type_and_arity_errors() {
        assert!(matches!(compile_str("r.sub"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("r.sub == true"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("!r.sub"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("g(r.sub)"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("g2(r.sub, p.sub, r.dom)"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("regexMatch(r.obj, p.obj)"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("keyMatch(r.obj)"), Err(AuthzError::ModelSyntax(_))));
        assert!(matches!(compile_str("sub == p.sub"), Err(AuthzError::ModelSyntax(_))));
    }

    #[test]
    fn test_references_policy() {
        assert!(compile_str("r.obj == p.obj").unwrap().references_policy());
        assert!(!compile_str("g(r.sub, \"admin\", r.dom)").unwrap().references_policy());
    }

    #[test]
    fn test_key_match() {
        assert!(key_match("/data/reports", "/data/*"));
        assert!(key_match("/data/", "/data/*"));
        assert!(!key_match("/other", "/data/*"));
        assert!(key_match("exact", "exact"));
        assert!(key_match("anything", "*"));
    }

    #[test]
    fn test_builtins() {
        assert!(Builtin::Contains.apply("component:billing", "billing"));
        assert!(Builtin::StartsWith.apply("org:acme/x", "org:acme"));
        assert!(Builtin::DomainMatch.apply("org:acme/project:p", "org:acme"));
        assert!(!Builtin::DomainMatch.apply("org:acmecorp", "org:acme"));
    }
}
