pub mod naming;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use dashmap::DashMap;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::template::types::{Expression, ParamType, Template};

// ─── Deployment scope ───────────────────────────────────────────────────────

/// Ambient identifiers for a deployment, passed in explicitly so derived
/// names stay a pure function of their inputs.
#[derive(Debug, Clone, Default)]
pub struct DeploymentScope {
    /// Subscription / account / project identifier the deployment lands in.
    pub scope_id: String,
}

impl DeploymentScope {
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
        }
    }
}

// ─── Resolved values ────────────────────────────────────────────────────────

/// The flat, immutable mapping produced by the value resolver: bound
/// parameters plus memoized variables. Secure parameter values are replaced
/// by provider-native secret references before they land here, so nothing
/// downstream (logs, hashes, state) ever sees plaintext.
#[derive(Debug, Clone)]
pub struct ResolvedValues {
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub secure_parameters: BTreeSet<String>,
    pub scope: DeploymentScope,
}

impl ResolvedValues {
    /// Evaluation context over these values only (no resource state).
    pub fn eval_context(&self) -> EvalContext<'_> {
        EvalContext {
            parameters: &self.parameters,
            variables: &self.variables,
            scope: &self.scope,
            resource_states: None,
            slot_aliases: None,
        }
    }
}

/// The marker stored and transmitted in place of a secure parameter value.
pub fn secret_ref(name: &str) -> String {
    format!("@secretRef('{name}')")
}

// ─── Parameter binding + variable resolution ────────────────────────────────

/// Validate caller-supplied parameter values against the template's
/// declarations and resolve all variables in dependency order.
pub fn resolve_values(
    template: &Template,
    supplied: &BTreeMap<String, serde_json::Value>,
    scope: DeploymentScope,
) -> Result<ResolvedValues> {
    for name in supplied.keys() {
        if template.parameter(name).is_none() {
            return Err(EngineError::validation(
                name.clone(),
                "no such parameter is declared",
            ));
        }
    }

    let mut parameters = BTreeMap::new();
    let mut secure_parameters = BTreeSet::new();

    for spec in &template.parameters {
        let value = match supplied.get(&spec.name).or(spec.default.as_ref()) {
            Some(v) => v.clone(),
            None => {
                return Err(EngineError::validation(
                    spec.name.clone(),
                    "required parameter has no value and no default",
                ))
            }
        };
        check_type(&spec.name, spec.param_type, &value)?;
        check_constraints(spec, &value)?;

        if spec.param_type.is_secure() {
            // Plaintext is validated above and then dropped; everything
            // downstream only ever sees the reference marker.
            secure_parameters.insert(spec.name.clone());
            parameters.insert(
                spec.name.clone(),
                serde_json::Value::String(secret_ref(&spec.name)),
            );
        } else {
            parameters.insert(spec.name.clone(), value);
        }
    }

    let variables = resolve_variables(template, &parameters, &scope)?;
    debug!(
        parameters = parameters.len(),
        variables = variables.len(),
        "values resolved"
    );

    Ok(ResolvedValues {
        parameters,
        variables,
        secure_parameters,
        scope,
    })
}

fn check_type(name: &str, param_type: ParamType, value: &serde_json::Value) -> Result<()> {
    let ok = match param_type {
        ParamType::String | ParamType::SecureString => value.is_string(),
        ParamType::Bool => value.is_boolean(),
        ParamType::Int => value.is_i64() || value.is_u64(),
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::validation(
            name,
            format!("expected {param_type:?} value"),
        ))
    }
}

fn check_constraints(
    spec: &crate::template::types::ParameterSpec,
    value: &serde_json::Value,
) -> Result<()> {
    if !spec.allowed_values.is_empty() && !spec.allowed_values.contains(value) {
        return Err(EngineError::validation(
            spec.name.clone(),
            "value is not in the allowed set",
        ));
    }
    if let serde_json::Value::String(s) = value {
        if let Some(min) = spec.min_length {
            if s.len() < min {
                return Err(EngineError::validation(
                    spec.name.clone(),
                    format!("shorter than minimum length {min}"),
                ));
            }
        }
        if let Some(max) = spec.max_length {
            if s.len() > max {
                return Err(EngineError::validation(
                    spec.name.clone(),
                    format!("longer than maximum length {max}"),
                ));
            }
        }
    }
    Ok(())
}

/// Resolve variables in dependency order via Kahn's algorithm over the
/// variable-to-variable reference edges. A cycle is a pre-flight error.
fn resolve_variables(
    template: &Template,
    parameters: &BTreeMap<String, serde_json::Value>,
    scope: &DeploymentScope,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for var in &template.variables {
        in_degree.entry(var.name.as_str()).or_insert(0);
        dependents.entry(var.name.as_str()).or_default();
    }
    for var in &template.variables {
        for path in var.value.references() {
            if path.first().map(String::as_str) == Some("variables") {
                if let Some(dep) = path.get(1) {
                    dependents
                        .entry(dep.as_str())
                        .or_default()
                        .push(var.name.as_str());
                    *in_degree.entry(var.name.as_str()).or_insert(0) += 1;
                }
            }
        }
    }

    // Seed sorted for deterministic evaluation order.
    let mut queue: VecDeque<&str> = {
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();
        ready.sort_unstable();
        ready.into()
    };

    let mut variables = BTreeMap::new();
    while let Some(name) = queue.pop_front() {
        let spec = template
            .variables
            .iter()
            .find(|v| v.name == name)
            .expect("queued variable is declared");
        let ctx = EvalContext {
            parameters,
            variables: &variables,
            scope,
            resource_states: None,
            slot_aliases: None,
        };
        let value = evaluate(&spec.value, &ctx)?;
        variables.insert(name.to_string(), value);

        if let Some(deps) = dependents.get(name) {
            for &dep in deps {
                let deg = in_degree.get_mut(dep).expect("dependent is declared");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dep);
                }
            }
        }
    }

    if variables.len() != template.variables.len() {
        let stuck = template
            .variables
            .iter()
            .find(|v| !variables.contains_key(&v.name))
            .map(|v| v.name.clone())
            .unwrap_or_default();
        return Err(EngineError::CyclicDefinition { name: stuck });
    }

    Ok(variables)
}

// ─── Expression evaluation ──────────────────────────────────────────────────

/// Everything an expression may be evaluated against. Resource states and
/// slot aliases are only present during apply and output projection.
pub struct EvalContext<'a> {
    pub parameters: &'a BTreeMap<String, serde_json::Value>,
    pub variables: &'a BTreeMap<String, serde_json::Value>,
    pub scope: &'a DeploymentScope,
    /// Completed resource states keyed by logical name, populated as nodes
    /// reach terminal success.
    pub resource_states: Option<&'a DashMap<String, serde_json::Value>>,
    /// Variant slot role -> selected member name.
    pub slot_aliases: Option<&'a BTreeMap<String, String>>,
}

/// Evaluate an expression to a JSON value. References into resource state
/// that has not been produced yet resolve to null; symbolic references are
/// deferred, never eager, and the graph guarantees dependencies complete
/// before their dependents evaluate.
pub fn evaluate(expr: &Expression, ctx: &EvalContext<'_>) -> Result<serde_json::Value> {
    match expr {
        Expression::Literal(v) => Ok(v.clone()),
        Expression::Reference(parts) => resolve_reference(parts, ctx),
        Expression::Call { name, args } => call_function(name, args, ctx),
        Expression::Not(inner) => Ok(serde_json::Value::Bool(!truthy(&evaluate(inner, ctx)?))),
        Expression::Eq(a, b) => Ok(serde_json::Value::Bool(
            evaluate(a, ctx)? == evaluate(b, ctx)?,
        )),
        Expression::And(a, b) => Ok(serde_json::Value::Bool(
            truthy(&evaluate(a, ctx)?) && truthy(&evaluate(b, ctx)?),
        )),
        Expression::Or(a, b) => Ok(serde_json::Value::Bool(
            truthy(&evaluate(a, ctx)?) || truthy(&evaluate(b, ctx)?),
        )),
        Expression::Object(entries) => {
            let mut map = serde_json::Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), evaluate(value, ctx)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        Expression::Array(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|item| evaluate(item, ctx))
                .collect::<Result<Vec<_>>>()?,
        )),
    }
}

fn resolve_reference(parts: &[String], ctx: &EvalContext<'_>) -> Result<serde_json::Value> {
    match parts.first().map(String::as_str) {
        Some("parameters") => {
            let name = parts.get(1).map(String::as_str).unwrap_or("");
            ctx.parameters
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::template(format!("unbound parameter '{name}'")))
        }
        Some("variables") => {
            let name = parts.get(1).map(String::as_str).unwrap_or("");
            ctx.variables
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::template(format!("unresolved variable '{name}'")))
        }
        Some("slot") => {
            let role = parts.get(1).map(String::as_str).unwrap_or("");
            let member = ctx
                .slot_aliases
                .and_then(|aliases| aliases.get(role))
                .cloned();
            match member {
                Some(member) => Ok(lookup_state(&member, parts.get(2..).unwrap_or(&[]), ctx)),
                None => Ok(serde_json::Value::Null),
            }
        }
        Some("resources") => {
            let name = parts.get(1).map(String::as_str).unwrap_or("");
            Ok(lookup_state(name, parts.get(2..).unwrap_or(&[]), ctx))
        }
        Some(name) => Ok(lookup_state(name, &parts[1..], ctx)),
        None => Ok(serde_json::Value::Null),
    }
}

fn lookup_state(name: &str, path: &[String], ctx: &EvalContext<'_>) -> serde_json::Value {
    let Some(states) = ctx.resource_states else {
        return serde_json::Value::Null;
    };
    match states.get(name) {
        Some(state) => traverse_json_value(state.value(), path),
        None => serde_json::Value::Null,
    }
}

/// Traverse a JSON value by attribute path, e.g. `["properties", "fqdn"]`.
pub fn traverse_json_value(value: &serde_json::Value, path: &[String]) -> serde_json::Value {
    let mut current = value;
    for key in path {
        match current {
            serde_json::Value::Object(map) => match map.get(key.as_str()) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            },
            serde_json::Value::Array(arr) => match key.parse::<usize>().ok().and_then(|i| arr.get(i))
            {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            },
            _ => return serde_json::Value::Null,
        }
    }
    current.clone()
}

fn call_function(name: &str, args: &[Expression], ctx: &EvalContext<'_>) -> Result<serde_json::Value> {
    match name {
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&stringify(&evaluate(arg, ctx)?));
            }
            Ok(serde_json::Value::String(out))
        }
        "uniqueString" => {
            let mut seeds = vec![ctx.scope.scope_id.clone()];
            for arg in args {
                seeds.push(stringify(&evaluate(arg, ctx)?));
            }
            Ok(serde_json::Value::String(naming::unique_string(
                seeds.iter().map(String::as_str),
            )))
        }
        "toLower" => {
            let value = args
                .first()
                .map(|a| evaluate(a, ctx))
                .transpose()?
                .unwrap_or(serde_json::Value::Null);
            Ok(serde_json::Value::String(stringify(&value).to_lowercase()))
        }
        "if" => {
            if args.len() != 3 {
                return Err(EngineError::template("if() takes exactly three arguments"));
            }
            if truthy(&evaluate(&args[0], ctx)?) {
                evaluate(&args[1], ctx)
            } else {
                evaluate(&args[2], ctx)
            }
        }
        other => Err(EngineError::template(format!(
            "unsupported function '{other}()'"
        ))),
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Truthiness for conditions: null and false are false, everything else true.
pub fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse_template;

    fn scope() -> DeploymentScope {
        DeploymentScope::new("sub-test")
    }

    #[test]
    fn binds_defaults_and_validates_types() {
        let template = parse_template(
            r#"{
                "parameters": {
                    "prefix": {"type": "string", "defaultValue": "nc50m", "minLength": 3, "maxLength": 8},
                    "useAcr": {"type": "bool", "defaultValue": true}
                }
            }"#,
        )
        .unwrap();

        let values = resolve_values(&template, &BTreeMap::new(), scope()).unwrap();
        assert_eq!(values.parameters["prefix"], serde_json::json!("nc50m"));
        assert_eq!(values.parameters["useAcr"], serde_json::json!(true));
    }

    #[test]
    fn rejects_missing_required_parameter() {
        let template = parse_template(
            r#"{"parameters": {"prefix": {"type": "string"}}}"#,
        )
        .unwrap();
        let err = resolve_values(&template, &BTreeMap::new(), scope()).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn rejects_constraint_violation() {
        let template = parse_template(
            r#"{"parameters": {"prefix": {"type": "string", "minLength": 3}}}"#,
        )
        .unwrap();
        let mut supplied = BTreeMap::new();
        supplied.insert("prefix".to_string(), serde_json::json!("ab"));
        let err = resolve_values(&template, &supplied, scope()).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn secure_parameter_is_replaced_by_reference() {
        let template = parse_template(
            r#"{"parameters": {"dbPassword": {"type": "secureString"}}}"#,
        )
        .unwrap();
        let mut supplied = BTreeMap::new();
        supplied.insert("dbPassword".to_string(), serde_json::json!("hunter2"));
        let values = resolve_values(&template, &supplied, scope()).unwrap();

        assert!(values.secure_parameters.contains("dbPassword"));
        let stored = values.parameters["dbPassword"].as_str().unwrap();
        assert!(!stored.contains("hunter2"));
        assert_eq!(stored, secret_ref("dbPassword"));
    }

    #[test]
    fn variables_resolve_in_dependency_order() {
        let template = parse_template(
            r#"{
                "parameters": {"prefix": {"type": "string", "defaultValue": "nc"}},
                "variables": {
                    "base": "${concat(variables.region, '-', parameters.prefix)}",
                    "region": "weu"
                }
            }"#,
        )
        .unwrap();
        let values = resolve_values(&template, &BTreeMap::new(), scope()).unwrap();
        assert_eq!(values.variables["base"], serde_json::json!("weu-nc"));
    }

    #[test]
    fn variable_cycle_is_rejected() {
        let template = parse_template(
            r#"{
                "variables": {
                    "a": "${variables.b}",
                    "b": "${variables.a}"
                }
            }"#,
        )
        .unwrap();
        let err = resolve_values(&template, &BTreeMap::new(), scope()).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDefinition { .. }));
    }

    #[test]
    fn short_reference_paths_resolve_to_null() {
        let states = DashMap::new();
        states.insert("pg".to_string(), serde_json::json!({"fqdn": "pg.example"}));
        let aliases = BTreeMap::new();
        let parameters = BTreeMap::new();
        let variables = BTreeMap::new();
        let deployment_scope = scope();
        let ctx = EvalContext {
            parameters: &parameters,
            variables: &variables,
            scope: &deployment_scope,
            resource_states: Some(&states),
            slot_aliases: Some(&aliases),
        };

        for parts in [vec!["resources"], vec!["slot"], vec!["resources", "pg"]] {
            let expr = Expression::reference(&parts);
            let value = evaluate(&expr, &ctx).unwrap();
            if parts == ["resources", "pg"] {
                assert_eq!(value, serde_json::json!({"fqdn": "pg.example"}));
            } else {
                assert_eq!(value, serde_json::Value::Null);
            }
        }
    }

    #[test]
    fn unique_string_is_scoped() {
        let template = parse_template(
            r#"{"variables": {"name": "${uniqueString('storage')}"}}"#,
        )
        .unwrap();
        let a = resolve_values(&template, &BTreeMap::new(), DeploymentScope::new("sub-a")).unwrap();
        let b = resolve_values(&template, &BTreeMap::new(), DeploymentScope::new("sub-b")).unwrap();
        assert_ne!(a.variables["name"], b.variables["name"]);
    }
}
