use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Template (the unified IR the parser produces) ──────────────────────────

/// A parsed deployment template: parameters, variables, resource
/// declarations, and outputs.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub parameters: Vec<ParameterSpec>,
    pub variables: Vec<VariableSpec>,
    pub resources: Vec<ResourceDecl>,
    pub outputs: Vec<OutputSpec>,
}

impl Template {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// All logical slot roles declared across resources.
    pub fn slot_roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self
            .resources
            .iter()
            .filter_map(|r| r.slot.as_deref())
            .collect();
        roles.sort_unstable();
        roles.dedup();
        roles
    }

    /// Members of a given slot role, in declaration order.
    pub fn slot_members(&self, role: &str) -> Vec<&ResourceDecl> {
        self.resources
            .iter()
            .filter(|r| r.slot.as_deref() == Some(role))
            .collect()
    }
}

// ─── Parameters ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamType {
    String,
    Bool,
    Int,
    SecureString,
}

impl ParamType {
    pub fn is_secure(self) -> bool {
        matches!(self, ParamType::SecureString)
    }
}

/// A declared deployment parameter. Bound once at invocation; immutable
/// afterward. Secure parameters are never echoed in logs, diffs, or state.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub param_type: ParamType,
    pub default: Option<serde_json::Value>,
    pub allowed_values: Vec<serde_json::Value>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

// ─── Variables ──────────────────────────────────────────────────────────────

/// A named expression over parameters and other variables, evaluated once
/// and memoized. Cycles among variables are a pre-flight error.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub name: String,
    pub value: Expression,
}

// ─── Resources ──────────────────────────────────────────────────────────────

/// A single resource declaration.
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    /// Unique logical name within the template.
    pub name: String,
    /// Provider resource type identifier (e.g. "network/virtualNetworks").
    pub resource_type: String,
    pub api_version: String,
    pub location: Option<String>,
    /// Boolean expression gating whether this resource is active.
    pub condition: Option<Expression>,
    /// Explicit dependencies by logical name (or slot role).
    pub depends_on: Vec<String>,
    /// Logical slot role for mutually-exclusive variants. Resources sharing
    /// a slot collapse to exactly one active member at selection time.
    pub slot: Option<String>,
    /// Externally-defined resource: its state is fetched, never created.
    pub existing: bool,
    /// Property tree; may embed references to parameters, variables, and
    /// other resources' attributes.
    pub properties: Expression,
}

// ─── Outputs ────────────────────────────────────────────────────────────────

/// A deployment output, evaluated once after apply completes.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub value: Expression,
}

// ─── Expression ─────────────────────────────────────────────────────────────

/// The expression tree used for conditions, variable definitions, property
/// values, and outputs. Deliberately small: references, a handful of
/// functions, and boolean operators, not a general templating language.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A plain JSON value with no embedded references.
    Literal(serde_json::Value),

    /// A dotted reference path:
    /// `parameters.x`, `variables.x`, `pg.fqdn`, `resources.pg.fqdn`,
    /// `slot.app.ingressFqdn`.
    Reference(Vec<String>),

    /// A function call: `concat(...)`, `uniqueString(...)`, `toLower(x)`,
    /// `if(cond, a, b)`.
    Call { name: String, args: Vec<Expression> },

    /// Boolean negation.
    Not(Box<Expression>),

    /// Equality comparison of two evaluated values.
    Eq(Box<Expression>, Box<Expression>),

    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),

    /// An object whose values may embed expressions.
    Object(BTreeMap<String, Expression>),

    /// An array whose elements may embed expressions.
    Array(Vec<Expression>),
}

impl Expression {
    pub fn string(s: impl Into<String>) -> Self {
        Expression::Literal(serde_json::Value::String(s.into()))
    }

    pub fn reference(parts: &[&str]) -> Self {
        Expression::Reference(parts.iter().map(|p| p.to_string()).collect())
    }

    /// Collect every reference path in this expression tree.
    pub fn references(&self) -> Vec<&[String]> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a [String]>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Reference(parts) => out.push(parts),
            Expression::Call { args, .. } => {
                for arg in args {
                    arg.collect_references(out);
                }
            }
            Expression::Not(inner) => inner.collect_references(out),
            Expression::Eq(a, b) | Expression::And(a, b) | Expression::Or(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Expression::Object(entries) => {
                for expr in entries.values() {
                    expr.collect_references(out);
                }
            }
            Expression::Array(items) => {
                for expr in items {
                    expr.collect_references(out);
                }
            }
        }
    }
}

/// Functions the evaluator understands. Anything else is a pre-flight error.
pub const SUPPORTED_FUNCTIONS: &[&str] = &["concat", "uniqueString", "toLower", "if"];
