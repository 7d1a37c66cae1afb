//! Schema-directed coercion of loosely-typed model output
//!
//! Model replies drift: keys arrive in camelCase, enum values capitalized or
//! paraphrased, numbers quoted, booleans expressed as confidence words. This
//! layer rewrites a parsed value tree against the declared JSON schema before
//! validation, so one drifted claim never aborts a whole book.
//!
//! Enum handling escalates: exact match → normalized (lowercase, spaces to
//! underscores) → alias table → (fuzzy mode only) containment match → first
//! enum value as a last resort. Substitution is logged, not fatal.

use serde_json::{Map, Value};
use tracing::warn;

/// How aggressively to match enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceMode {
    /// Exact / normalized / alias-table matching only.
    Strict,
    /// Additionally accept containment matches and substitute the first enum
    /// value when nothing matches at all.
    FuzzyEnums,
}

/// Fixed alias table applied after normalization. Only aliases whose target
/// actually appears in the field's enum list are used.
const ENUM_ALIASES: &[(&str, &str)] = &[
    ("core", "core_insight"),
    ("coreinsight", "core_insight"),
    ("key_insight", "core_insight"),
    ("supporting", "supporting_insight"),
    ("support", "supporting_insight"),
    ("supportinginsight", "supporting_insight"),
    ("noise", "filler"),
    ("irrelevant", "filler"),
    ("duplicate", "redundant"),
    ("guideline", "recommendation"),
    ("advice", "recommendation"),
    ("causation", "causal"),
    ("cause_effect", "causal"),
    ("limit", "constraint"),
    ("table_of_contents", "toc"),
    ("heading", "regex"),
    ("clarifies", "clarifies_application"),
    ("removes", "removes_ambiguity"),
];

/// Strings that mean "no value" when a number was expected.
const ABSENT_MARKERS: &[&str] = &["not specified", "unspecified", "n/a", "na", "unknown", ""];

/// Coerce `value` toward `schema` (the root schema produced by `schemars`).
pub fn coerce_value(value: &Value, schema: &Value, mode: CoerceMode) -> Value {
    coerce_inner(value, schema, schema, mode, "$")
}

fn coerce_inner(value: &Value, schema: &Value, root: &Value, mode: CoerceMode, path: &str) -> Value {
    let schema = resolve_schema(schema, root);

    // Option<T> and similar unions: coerce toward the first non-null branch.
    if let Some(branch) = union_branch(schema) {
        if value.is_null() {
            return Value::Null;
        }
        return coerce_inner(value, branch, root, mode, path);
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        return coerce_enum(value, allowed, mode, path);
    }

    let types = schema_types(schema);

    if types.iter().any(|t| t == "object") || schema.get("properties").is_some() {
        return coerce_object(value, schema, root, mode, path);
    }
    if types.iter().any(|t| t == "array") || schema.get("items").is_some() {
        return coerce_array(value, schema, root, mode, path);
    }
    if types.iter().any(|t| t == "integer" || t == "number") {
        return coerce_number(value, types.iter().any(|t| t == "integer"));
    }
    if types.iter().any(|t| t == "boolean") {
        return coerce_boolean(value);
    }

    value.clone()
}

/// Follow a `$ref` into the root schema's definitions.
fn resolve_schema<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        let name = reference.rsplit('/').next().unwrap_or_default();
        for section in ["$defs", "definitions"] {
            if let Some(resolved) = root.get(section).and_then(|d| d.get(name)) {
                return resolved;
            }
        }
    }
    schema
}

/// For `anyOf`/`oneOf` unions, return the first branch that is not the null
/// type (how `schemars` encodes `Option<T>` around referenced types).
fn union_branch(schema: &Value) -> Option<&Value> {
    for key in ["anyOf", "oneOf"] {
        if let Some(branches) = schema.get(key).and_then(Value::as_array) {
            return branches
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) != Some("null"));
        }
    }
    None
}

/// Declared types, handling both `"type": "x"` and `"type": ["x", "null"]`.
fn schema_types(schema: &Value) -> Vec<String> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| *t != "null")
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn coerce_object(value: &Value, schema: &Value, root: &Value, mode: CoerceMode, path: &str) -> Value {
    let Some(incoming) = value.as_object() else {
        return value.clone();
    };
    let properties = schema.get("properties").and_then(Value::as_object);

    let mut out = Map::with_capacity(incoming.len());
    for (key, field) in incoming {
        let renamed = to_snake_case(key);
        let coerced = match properties.and_then(|p| p.get(&renamed)) {
            Some(field_schema) => coerce_inner(
                field,
                field_schema,
                root,
                mode,
                &format!("{}.{}", path, renamed),
            ),
            None => field.clone(),
        };
        // Numeric no-value markers coerce to null; dropping the key entirely
        // lets optional fields default instead of failing validation.
        if coerced.is_null() && !field.is_null() {
            continue;
        }
        out.insert(renamed, coerced);
    }
    Value::Object(out)
}

fn coerce_array(value: &Value, schema: &Value, root: &Value, mode: CoerceMode, path: &str) -> Value {
    let Some(items) = value.as_array() else {
        return value.clone();
    };
    let item_schema = schema.get("items").unwrap_or(&Value::Null);
    Value::Array(
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                coerce_inner(item, item_schema, root, mode, &format!("{}[{}]", path, i))
            })
            .collect(),
    )
}

fn coerce_number(value: &Value, integer: bool) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => {
            let trimmed = s.trim();
            if ABSENT_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
                return Value::Null;
            }
            if integer {
                if let Ok(parsed) = trimmed.parse::<i64>() {
                    return Value::from(parsed);
                }
            }
            if let Ok(parsed) = trimmed.parse::<f64>() {
                if integer && parsed.fract() == 0.0 {
                    return Value::from(parsed as i64);
                }
                return Value::from(parsed);
            }
            value.clone()
        }
        _ => value.clone(),
    }
}

fn coerce_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "high" | "medium" => Value::Bool(true),
            "false" | "no" | "low" | "none" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

fn coerce_enum(value: &Value, allowed: &[Value], mode: CoerceMode, path: &str) -> Value {
    let Some(candidate) = value.as_str() else {
        return value.clone();
    };
    let allowed_strs: Vec<&str> = allowed.iter().filter_map(Value::as_str).collect();

    // Exact match.
    if allowed_strs.contains(&candidate) {
        return value.clone();
    }

    // Normalized: lowercase, spaces and dashes to underscores.
    let normalized = normalize_enum_value(candidate);
    if allowed_strs.contains(&normalized.as_str()) {
        return Value::String(normalized);
    }

    // Alias table (only when the target is actually in this field's enum).
    for (alias, target) in ENUM_ALIASES {
        if normalized == *alias && allowed_strs.contains(target) {
            return Value::String((*target).to_string());
        }
    }

    if mode == CoerceMode::FuzzyEnums {
        // Containment in either direction, e.g. "a core insight" or "core".
        if normalized.len() > 2 {
            if let Some(found) = allowed_strs
                .iter()
                .find(|a| normalized.contains(*a) || a.contains(normalized.as_str()))
            {
                return Value::String((*found).to_string());
            }
        }
        // Last resort: substitute the first enum value so the rest of the
        // batch survives.
        if let Some(first) = allowed_strs.first() {
            warn!(
                field = path,
                got = candidate,
                substituted = first,
                "enum value unrecognized, substituting"
            );
            return Value::String((*first).to_string());
        }
    }

    value.clone()
}

fn normalize_enum_value(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// camelCase / PascalCase → snake_case. Keys already in snake_case pass
/// through unchanged.
fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let chars: Vec<char> = key.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            if i > 0 && chars[i - 1] != '_' && (prev_lower || next_lower) {
                out.push('_');
            }
            for lowered in c.to_lowercase() {
                out.push(lowered);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn label_score_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "label": {
                    "type": "string",
                    "enum": ["core_insight", "supporting_insight", "redundant", "filler"]
                },
                "score": { "type": "number" }
            }
        })
    }

    #[test]
    fn snake_cases_keys_and_normalizes_enum_and_number() {
        let input = json!({"Label": "Core Insight", "Score": "0.8"});
        let out = coerce_value(&input, &label_score_schema(), CoerceMode::Strict);
        assert_eq!(out, json!({"label": "core_insight", "score": 0.8}));
    }

    #[test]
    fn confidence_words_coerce_to_booleans() {
        let schema = json!({
            "type": "object",
            "properties": { "has_toc": { "type": "boolean" } }
        });
        for (word, expected) in [("medium", true), ("high", true), ("low", false), ("none", false)] {
            let out = coerce_value(&json!({ "has_toc": word }), &schema, CoerceMode::Strict);
            assert_eq!(out, json!({ "has_toc": expected }), "word: {}", word);
        }
        let out = coerce_value(&json!({ "has_toc": "true" }), &schema, CoerceMode::Strict);
        assert_eq!(out, json!({ "has_toc": true }));
    }

    #[test]
    fn absent_markers_drop_numeric_fields() {
        let schema = json!({
            "type": "object",
            "properties": { "page_number": { "type": "integer" } }
        });
        let out = coerce_value(
            &json!({ "page_number": "not specified" }),
            &schema,
            CoerceMode::Strict,
        );
        assert_eq!(out, json!({}));
    }

    #[test]
    fn integer_strings_parse() {
        let schema = json!({
            "type": "object",
            "properties": { "count": { "type": "integer" } }
        });
        let out = coerce_value(&json!({ "count": "42" }), &schema, CoerceMode::Strict);
        assert_eq!(out, json!({ "count": 42 }));
        let out = coerce_value(&json!({ "count": "42.0" }), &schema, CoerceMode::Strict);
        assert_eq!(out, json!({ "count": 42 }));
    }

    #[test]
    fn alias_table_applies_when_target_present() {
        let out = coerce_value(
            &json!({ "label": "core" }),
            &label_score_schema(),
            CoerceMode::Strict,
        );
        assert_eq!(out["label"], json!("core_insight"));
    }

    #[test]
    fn strict_mode_leaves_unknown_enum_values_alone() {
        let out = coerce_value(
            &json!({ "label": "fascinating" }),
            &label_score_schema(),
            CoerceMode::Strict,
        );
        assert_eq!(out["label"], json!("fascinating"));
    }

    #[test]
    fn fuzzy_mode_matches_containment_then_substitutes() {
        let out = coerce_value(
            &json!({ "label": "a real core insight" }),
            &label_score_schema(),
            CoerceMode::FuzzyEnums,
        );
        assert_eq!(out["label"], json!("core_insight"));

        let out = coerce_value(
            &json!({ "label": "??" }),
            &label_score_schema(),
            CoerceMode::FuzzyEnums,
        );
        // First enum value substituted so the batch survives.
        assert_eq!(out["label"], json!("core_insight"));
    }

    #[test]
    fn refs_resolve_through_defs() {
        let schema = json!({
            "type": "object",
            "properties": { "kind": { "$ref": "#/$defs/Kind" } },
            "$defs": {
                "Kind": { "type": "string", "enum": ["principle", "rule"] }
            }
        });
        let out = coerce_value(&json!({ "kind": "Rule" }), &schema, CoerceMode::Strict);
        assert_eq!(out["kind"], json!("rule"));
    }

    #[test]
    fn nested_arrays_coerce_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "claims": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "claim": { "type": "string" },
                            "type": { "type": "string", "enum": ["principle", "rule"] }
                        }
                    }
                }
            }
        });
        let input = json!({
            "Claims": [
                { "Claim": "a", "Type": "Principle" },
                { "Claim": "b", "Type": "RULE" }
            ]
        });
        let out = coerce_value(&input, &schema, CoerceMode::Strict);
        assert_eq!(
            out,
            json!({
                "claims": [
                    { "claim": "a", "type": "principle" },
                    { "claim": "b", "type": "rule" }
                ]
            })
        );
    }

    #[test]
    fn option_unions_pass_null_through() {
        let schema = json!({
            "type": "object",
            "properties": {
                "notes": {
                    "anyOf": [ { "type": "string" }, { "type": "null" } ]
                }
            }
        });
        let out = coerce_value(&json!({ "notes": null }), &schema, CoerceMode::Strict);
        assert_eq!(out, json!({ "notes": null }));
    }

    #[test]
    fn snake_case_handles_acronym_runs() {
        assert_eq!(to_snake_case("hasTOC"), "has_toc");
        assert_eq!(to_snake_case("TOCEntry"), "toc_entry");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
        assert_eq!(to_snake_case("PageNumber"), "page_number");
    }

    #[test]
    fn prose_fields_are_not_lowercased() {
        let schema = json!({
            "type": "object",
            "properties": { "compressed_content": { "type": "string" } }
        });
        let out = coerce_value(
            &json!({ "compressed_content": "The Author Argues..." }),
            &schema,
            CoerceMode::Strict,
        );
        assert_eq!(out["compressed_content"], json!("The Author Argues..."));
    }
}
