//! Module outputs validation.
//!
//! Module types may declare a `module_outputs_schema`. Outputs returned by a
//! `getModuleOutputs` handler are checked against the module type's own
//! schema and then against the schema of every base module type, so a
//! derived type can never produce outputs its bases would reject.
//!
//! Only a small JSON-schema subset is understood: `type`, `properties`,
//! `required` and `items`. Unknown keywords are ignored.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{GardenError, Result};

use super::types::ModuleTypeDefinition;

/// Check `value` against `schema`, returning a message for the first violation.
pub fn check_schema(value: &Value, schema: &Value) -> Option<String> {
    check_at(value, schema, "")
}

fn check_at(value: &Value, schema: &Value, path: &str) -> Option<String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !matches_type(value, expected) {
            let subject = if path.is_empty() {
                "value".to_string()
            } else {
                format!("key {}", path)
            };
            return Some(format!("{} must be {}", subject, describe_type(expected)));
        }
    }

    if let Value::Object(map) = value {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    return Some(format!("key {}.{} is required", path, key));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, property_schema) in properties {
                if let Some(child) = map.get(key) {
                    let child_path = format!("{}.{}", path, key);
                    if let Some(msg) = check_at(child, property_schema, &child_path) {
                        return Some(msg);
                    }
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            let child_path = format!("{}[{}]", path, i);
            if let Some(msg) = check_at(item, item_schema, &child_path) {
                return Some(msg);
            }
        }
    }

    None
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &str) -> String {
    match expected {
        "integer" | "array" | "object" => format!("an {}", expected),
        "null" => "null".to_string(),
        other => format!("a {}", other),
    }
}

/// Walk the `base` chain of a module type, nearest base first.
///
/// Fails if a base is not among `module_types` or if the chain loops.
pub fn get_module_type_bases<'a>(
    module_types: &'a BTreeMap<String, ModuleTypeDefinition>,
    type_name: &str,
) -> Result<Vec<&'a ModuleTypeDefinition>> {
    let mut bases = Vec::new();
    let mut seen = vec![type_name.to_string()];
    let mut current = module_types
        .get(type_name)
        .ok_or_else(|| unrecognized_module_type(type_name))?;

    while let Some(base_name) = current.base.as_deref() {
        if seen.iter().any(|s| s == base_name) {
            seen.push(base_name.to_string());
            return Err(GardenError::Plugin(format!(
                "Found circular dependency between module type bases:\n\n{}",
                seen.join(" <- ")
            )));
        }
        let base = module_types.get(base_name).ok_or_else(|| {
            GardenError::Configuration(format!(
                "Module type '{}' specifies base module type '{}', which is not available",
                current.name, base_name
            ))
        })?;
        seen.push(base_name.to_string());
        bases.push(base);
        current = base;
    }

    Ok(bases)
}

/// Validate module outputs against the module type schema and its bases' schemas.
pub fn validate_module_outputs(
    module_types: &BTreeMap<String, ModuleTypeDefinition>,
    type_name: &str,
    module_name: &str,
    outputs: &Value,
) -> Result<()> {
    let definition = module_types
        .get(type_name)
        .ok_or_else(|| unrecognized_module_type(type_name))?;

    if let Some(schema) = &definition.module_outputs_schema {
        if let Some(msg) = check_schema(outputs, schema) {
            return Err(GardenError::Validation(format!(
                "Error validating outputs for module '{}': {}",
                module_name, msg
            )));
        }
    }

    for base in get_module_type_bases(module_types, type_name)? {
        if let Some(schema) = &base.module_outputs_schema {
            if let Some(msg) = check_schema(outputs, schema) {
                return Err(GardenError::Validation(format!(
                    "Error validating outputs for module '{}' (base schema from '{}' plugin): {}",
                    module_name, base.plugin_name, msg
                )));
            }
        }
    }

    Ok(())
}

fn unrecognized_module_type(type_name: &str) -> GardenError {
    GardenError::Configuration(format!("Unrecognized module type '{}'", type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::ModuleTypeSpec;
    use serde_json::json;

    fn types(specs: &[(&str, ModuleTypeSpec)]) -> BTreeMap<String, ModuleTypeDefinition> {
        specs
            .iter()
            .map(|(plugin, spec)| {
                (spec.name.clone(), ModuleTypeDefinition::from_spec(plugin, spec))
            })
            .collect()
    }

    fn foo_schema() -> Value {
        json!({ "type": "object", "properties": { "foo": { "type": "string" } } })
    }

    #[test]
    fn test_check_schema_type_mismatch() {
        let msg = check_schema(&json!({ "foo": 123 }), &foo_schema()).unwrap();
        assert_eq!(msg, "key .foo must be a string");
    }

    #[test]
    fn test_check_schema_accepts_valid() {
        assert!(check_schema(&json!({ "foo": "bar", "extra": 1 }), &foo_schema()).is_none());
    }

    #[test]
    fn test_check_schema_required_and_nested() {
        let schema = json!({
            "type": "object",
            "required": ["a"],
            "properties": {
                "a": {
                    "type": "object",
                    "properties": {
                        "b": { "type": "array", "items": { "type": "integer" } }
                    }
                }
            }
        });
        assert_eq!(check_schema(&json!({}), &schema).unwrap(), "key .a is required");
        assert_eq!(
            check_schema(&json!({ "a": { "b": [1, "x"] } }), &schema).unwrap(),
            "key .a.b[1] must be an integer"
        );
    }

    #[test]
    fn test_check_schema_top_level() {
        assert_eq!(
            check_schema(&json!("str"), &json!({ "type": "object" })).unwrap(),
            "value must be an object"
        );
    }

    #[test]
    fn test_validate_against_base_schema() {
        let module_types = types(&[
            ("base", ModuleTypeSpec::new("base", "Base").with_outputs_schema(foo_schema())),
            ("foo", ModuleTypeSpec::new("foo", "Foo").with_base("base")),
        ]);

        let err = validate_module_outputs(&module_types, "foo", "my-module", &json!({ "foo": 123 }))
            .unwrap_err();
        assert!(err.to_string().contains(
            "Error validating outputs for module 'my-module' (base schema from 'base' plugin): key .foo must be a string"
        ));

        let valid = json!({ "foo": "ok" });
        assert!(validate_module_outputs(&module_types, "foo", "my-module", &valid).is_ok());
    }

    #[test]
    fn test_validate_against_own_schema() {
        let module_types = types(&[(
            "p",
            ModuleTypeSpec::new("foo", "Foo").with_outputs_schema(foo_schema()),
        )]);
        let err = validate_module_outputs(&module_types, "foo", "m", &json!({ "foo": false }))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Error validating outputs for module 'm': key .foo must be a string"
        );
    }

    #[test]
    fn test_bases_nearest_first() {
        let module_types = types(&[
            ("a", ModuleTypeSpec::new("root", "Root")),
            ("b", ModuleTypeSpec::new("mid", "Mid").with_base("root")),
            ("c", ModuleTypeSpec::new("leaf", "Leaf").with_base("mid")),
        ]);
        let names: Vec<_> = get_module_type_bases(&module_types, "leaf")
            .unwrap()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["mid", "root"]);
    }

    #[test]
    fn test_unknown_module_type() {
        let module_types = types(&[]);
        let err = validate_module_outputs(&module_types, "nope", "m", &json!({})).unwrap_err();
        assert!(err.is_configuration());
    }
}
