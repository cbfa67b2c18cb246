use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Types the oracle can be asked to produce.
///
/// Strict structured-output mode needs `additionalProperties: false` on every
/// object, every property listed in `required` (nullable ones included) and no
/// `$ref` indirection, so the generated schema is rewritten accordingly.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn strict_schema() -> Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();

        inline_refs(&mut value);
        close_objects(&mut value);
        drop_numeric_formats(&mut value);

        if let Value::Object(map) = &mut value {
            map.remove("definitions");
            map.remove("$schema");
            map.remove("title");
        }
        value
    }

    fn schema_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

fn is_object_type(map: &serde_json::Map<String, Value>) -> bool {
    match map.get("type") {
        Some(Value::String(t)) => t == "object",
        Some(Value::Array(types)) => types.iter().any(|t| t == "object"),
        _ => false,
    }
}

fn close_objects(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if is_object_type(map) {
                map.insert("additionalProperties".into(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let keys = props.keys().cloned().map(Value::String).collect();
                    map.insert("required".into(), Value::Array(keys));
                }
            }
            for (_, child) in map.iter_mut() {
                close_objects(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(close_objects),
        _ => {}
    }
}

fn is_numeric_type(map: &serde_json::Map<String, Value>) -> bool {
    let numeric = |t: &Value| t == "integer" || t == "number";
    match map.get("type") {
        Some(Value::Array(types)) => types.iter().any(numeric),
        Some(t) => numeric(t),
        None => false,
    }
}

/// schemars annotates integers with `format: uint` and `minimum`, which strict
/// mode rejects.
fn drop_numeric_formats(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if is_numeric_type(map) {
                map.remove("format");
                map.remove("minimum");
            }
            for (_, child) in map.iter_mut() {
                drop_numeric_formats(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(drop_numeric_formats),
        _ => {}
    }
}

fn inline_refs(value: &mut Value) {
    let definitions = match value {
        Value::Object(map) => map.get("definitions").cloned(),
        _ => None,
    };
    if let Some(defs) = definitions {
        inline_with(value, &defs);
    }
}

fn inline_with(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .map(|path| path.trim_start_matches("#/definitions/").to_string());
            if let Some(name) = target {
                if let Some(def) = definitions.get(&name) {
                    *value = def.clone();
                    inline_with(value, definitions);
                    return;
                }
            }

            // schemars wraps documented references as `allOf: [{$ref}]`.
            let single = match map.get("allOf") {
                Some(Value::Array(all_of)) if all_of.len() == 1 => all_of.first().cloned(),
                _ => None,
            };
            if let Some(inner) = single {
                map.remove("allOf");
                let mut inner = inner;
                inline_with(&mut inner, definitions);
                if let Value::Object(inner_map) = inner {
                    for (k, v) in inner_map {
                        map.entry(k).or_insert(v);
                    }
                }
            }

            for (_, child) in map.iter_mut() {
                inline_with(child, definitions);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| inline_with(item, definitions)),
        _ => {}
    }
}

/// Strips a markdown code fence some providers wrap JSON answers in.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    enum Mood {
        #[serde(rename = "calm")]
        Calm,
        #[serde(rename = "busy")]
        Busy,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Seller {
        name: String,
        phone: Option<String>,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Listing {
        /// Who is selling.
        seller: Seller,
        mood: Mood,
        prices: Vec<f64>,
        index: usize,
    }

    #[test]
    fn every_property_is_required_and_closed() {
        let schema = Seller::strict_schema();
        assert_eq!(schema["additionalProperties"], Value::Bool(false));
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"name"));
        assert!(required.contains(&"phone"));
    }

    #[test]
    fn nested_definitions_are_inlined() {
        let schema = Listing::strict_schema();
        let text = serde_json::to_string(&schema).unwrap();
        assert!(!text.contains("$ref"));
        assert!(!text.contains("definitions"));
        assert!(schema.get("$schema").is_none());

        let seller = &schema["properties"]["seller"];
        assert_eq!(seller["type"], "object");
        assert_eq!(seller["additionalProperties"], Value::Bool(false));
        assert!(schema["properties"]["mood"]["enum"].is_array());
    }

    #[test]
    fn integer_annotations_are_dropped() {
        let schema = Listing::strict_schema();
        let index = &schema["properties"]["index"];
        assert_eq!(index["type"], "integer");
        assert!(index.get("format").is_none());
        assert!(index.get("minimum").is_none());
        assert!(schema["properties"]["prices"]["items"].get("format").is_none());
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n[]\n```"), "[]");
        assert_eq!(strip_code_blocks(" {} "), "{}");
    }
}
