use std::collections::HashSet;

use crate::error::{EngineError, Result};
use crate::template::types::{Expression, Template, SUPPORTED_FUNCTIONS};

/// Static validation over a parsed template. Everything here is pre-flight:
/// a template that passes is structurally sound, so the only failures left
/// for apply time are provider failures.
pub fn validate(template: &Template) -> Result<()> {
    validate_unique_names(template)?;
    validate_depends_on(template)?;
    validate_slots(template)?;
    validate_scalar_references(template)?;
    validate_functions(template)?;
    validate_output_references(template)?;
    Ok(())
}

fn validate_unique_names(template: &Template) -> Result<()> {
    let mut seen = HashSet::new();
    for param in &template.parameters {
        if !seen.insert(format!("parameters.{}", param.name)) {
            return Err(EngineError::template(format!(
                "duplicate parameter '{}'",
                param.name
            )));
        }
    }
    seen.clear();
    for var in &template.variables {
        if !seen.insert(var.name.clone()) {
            return Err(EngineError::template(format!(
                "duplicate variable '{}'",
                var.name
            )));
        }
    }
    seen.clear();
    for resource in &template.resources {
        if resource.name.is_empty() {
            return Err(EngineError::template("resource with empty logical name"));
        }
        if resource.resource_type.is_empty() {
            return Err(EngineError::template(format!(
                "resource '{}' has no type",
                resource.name
            )));
        }
        if !seen.insert(resource.name.clone()) {
            return Err(EngineError::template(format!(
                "duplicate resource '{}'",
                resource.name
            )));
        }
    }
    Ok(())
}

/// Every `dependsOn` entry must name a declared resource or a slot role.
fn validate_depends_on(template: &Template) -> Result<()> {
    let names: HashSet<&str> = template.resources.iter().map(|r| r.name.as_str()).collect();
    let slots: HashSet<&str> = template.slot_roles().into_iter().collect();

    for resource in &template.resources {
        for dep in &resource.depends_on {
            if !names.contains(dep.as_str()) && !slots.contains(dep.as_str()) {
                return Err(EngineError::DanglingReference {
                    referrer: resource.name.clone(),
                    target: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Slots with more than one member must gate every member with a condition;
/// otherwise "exactly one active" cannot hold for any input.
fn validate_slots(template: &Template) -> Result<()> {
    for role in template.slot_roles() {
        let members = template.slot_members(role);
        if members.len() > 1 {
            for member in &members {
                if member.condition.is_none() {
                    return Err(EngineError::template(format!(
                        "slot '{role}' member '{}' has no condition; variant members must be mutually exclusive",
                        member.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// `parameters.*` and `variables.*` references must resolve to declared
/// names, and variables may not reach into resource state.
fn validate_scalar_references(template: &Template) -> Result<()> {
    let param_names: HashSet<&str> = template.parameters.iter().map(|p| p.name.as_str()).collect();
    let var_names: HashSet<&str> = template.variables.iter().map(|v| v.name.as_str()).collect();

    let check_scalars = |owner: &str, expr: &Expression| -> Result<()> {
        for path in expr.references() {
            match path.first().map(String::as_str) {
                Some("parameters") => {
                    let name = path.get(1).map(String::as_str).unwrap_or("");
                    if !param_names.contains(name) {
                        return Err(EngineError::validation(
                            name,
                            format!("'{owner}' references undeclared parameter"),
                        ));
                    }
                }
                Some("variables") => {
                    let name = path.get(1).map(String::as_str).unwrap_or("");
                    if !var_names.contains(name) {
                        return Err(EngineError::template(format!(
                            "'{owner}' references undeclared variable '{name}'"
                        )));
                    }
                }
                Some(head @ ("resources" | "slot")) => {
                    if path.len() < 2 {
                        return Err(EngineError::template(format!(
                            "'{owner}' has a bare '{head}' reference; a resource name or slot role is required"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    };

    for var in &template.variables {
        check_scalars(&var.name, &var.value)?;
        for path in var.value.references() {
            match path.first().map(String::as_str) {
                Some("parameters") | Some("variables") => {}
                Some(other) => {
                    return Err(EngineError::template(format!(
                        "variable '{}' references '{other}'; variables may only use parameters and other variables",
                        var.name
                    )))
                }
                None => {}
            }
        }
    }

    for resource in &template.resources {
        check_scalars(&resource.name, &resource.properties)?;
        if let Some(cond) = &resource.condition {
            check_scalars(&resource.name, cond)?;
            // Conditions are evaluated at variant selection, before any
            // resource state exists, so a resource reference there can only
            // ever see null and would silently disable the node.
            for path in cond.references() {
                match path.first().map(String::as_str) {
                    Some("parameters") | Some("variables") | None => {}
                    Some(other) => {
                        return Err(EngineError::template(format!(
                            "condition on '{}' references '{other}'; conditions may only use parameters and variables",
                            resource.name
                        )))
                    }
                }
            }
        }
    }
    for output in &template.outputs {
        check_scalars(&output.name, &output.value)?;
    }
    Ok(())
}

fn validate_functions(template: &Template) -> Result<()> {
    fn check(owner: &str, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Call { name, args } => {
                if !SUPPORTED_FUNCTIONS.contains(&name.as_str()) {
                    return Err(EngineError::template(format!(
                        "'{owner}' calls unsupported function '{name}()'"
                    )));
                }
                for arg in args {
                    check(owner, arg)?;
                }
                Ok(())
            }
            Expression::Not(inner) => check(owner, inner),
            Expression::Eq(a, b) | Expression::And(a, b) | Expression::Or(a, b) => {
                check(owner, a)?;
                check(owner, b)
            }
            Expression::Object(entries) => {
                for e in entries.values() {
                    check(owner, e)?;
                }
                Ok(())
            }
            Expression::Array(items) => {
                for e in items {
                    check(owner, e)?;
                }
                Ok(())
            }
            Expression::Literal(_) | Expression::Reference(_) => Ok(()),
        }
    }

    for var in &template.variables {
        check(&var.name, &var.value)?;
    }
    for resource in &template.resources {
        check(&resource.name, &resource.properties)?;
        if let Some(cond) = &resource.condition {
            check(&resource.name, cond)?;
        }
    }
    for output in &template.outputs {
        check(&output.name, &output.value)?;
    }
    Ok(())
}

/// Output resource references must point at declared resources or slot
/// roles. Whether the target finally succeeds is an apply-time concern (the
/// projector then reports the output as unavailable), but a name that exists
/// nowhere in the template is a pre-flight error.
fn validate_output_references(template: &Template) -> Result<()> {
    let names: HashSet<&str> = template.resources.iter().map(|r| r.name.as_str()).collect();
    let slots: HashSet<&str> = template.slot_roles().into_iter().collect();

    for output in &template.outputs {
        for path in output.value.references() {
            match path.first().map(String::as_str) {
                Some("parameters") | Some("variables") => {}
                Some("slot") => {
                    let role = path.get(1).map(String::as_str).unwrap_or("");
                    if !slots.contains(role) {
                        return Err(EngineError::DanglingReference {
                            referrer: format!("output.{}", output.name),
                            target: format!("slot.{role}"),
                        });
                    }
                }
                Some("resources") => {
                    let name = path.get(1).map(String::as_str).unwrap_or("");
                    if !names.contains(name) {
                        return Err(EngineError::DanglingReference {
                            referrer: format!("output.{}", output.name),
                            target: name.to_string(),
                        });
                    }
                }
                Some(head) => {
                    if !names.contains(head) && !slots.contains(head) {
                        return Err(EngineError::DanglingReference {
                            referrer: format!("output.{}", output.name),
                            target: head.to_string(),
                        });
                    }
                }
                None => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::template::parser::parse_template;

    #[test]
    fn rejects_bare_resources_reference() {
        let err = parse_template(
            r#"{
                "resources": [
                    {"name": "app", "type": "t/app", "apiVersion": "1",
                     "properties": {"oops": "${resources}"}}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Template(ref msg) if msg.contains("bare 'resources'")));
    }

    #[test]
    fn rejects_slot_reference_without_role() {
        let err = parse_template(
            r#"{
                "resources": [
                    {"name": "app", "type": "t/app", "apiVersion": "1",
                     "properties": {"image": "${slot}"}}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Template(ref msg) if msg.contains("bare 'slot'")));
    }

    #[test]
    fn rejects_resource_reference_in_condition() {
        let err = parse_template(
            r#"{
                "resources": [
                    {"name": "app", "type": "t/app", "apiVersion": "1",
                     "condition": "${missing.enabled}", "properties": {}}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Template(ref msg) if msg.contains("conditions may only use parameters and variables")
        ));
    }

    #[test]
    fn accepts_scalar_condition_references() {
        let template = parse_template(
            r#"{
                "parameters": {"flag": {"type": "bool", "defaultValue": true}},
                "resources": [
                    {"name": "app", "type": "t/app", "apiVersion": "1",
                     "condition": "${parameters.flag}", "properties": {}}
                ]
            }"#,
        );
        assert!(template.is_ok());
    }
}
