use super::{ApiInfo, Function, FunctionProperty, MAX_FUNCTION_NAME_LEN, PropertyLocation};
use crate::openapi::{OpenApiDoc, OpenApiParseError, join_url};
use crate::plugin::{OperationKey, PluginOperation, PluginOperations};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

static INVALID_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

/// OpenAPI method keys compiled into functions. The AWS any-method key maps to `any`.
const METHOD_KEYS: [(&str, &str); 8] = [
    ("get", "get"),
    ("post", "post"),
    ("put", "put"),
    ("delete", "delete"),
    ("patch", "patch"),
    ("head", "head"),
    ("options", "options"),
    ("x-amazon-apigateway-any-method", "any"),
];

/// Request body media types, most preferred first.
const BODY_MEDIA_TYPES: [&str; 5] = [
    "application/json",
    "application/xml",
    "multipart/form-data",
    "application/x-www-form-urlencoded",
    "application/octet-stream",
];

/// Replace characters the function-calling APIs reject and cap the length.
pub fn sanitize(name: &str) -> String {
    INVALID_NAME_CHARS
        .replace_all(name, "_")
        .chars()
        .take(MAX_FUNCTION_NAME_LEN)
        .collect()
}

/// Compile every operation of `doc` (or only `selected`) into functions, in document order.
pub fn compile(
    doc: &OpenApiDoc,
    plugin_operations: &PluginOperations,
    selected: Option<&OperationKey>,
) -> Result<Vec<Function>, OpenApiParseError> {
    let server_url = doc.server_url()?;
    let paths = doc.paths()?;

    let mut functions = Vec::new();
    let mut seen_names: HashMap<String, usize> = HashMap::new();

    for (path, raw_item) in paths {
        let item = doc.resolve(raw_item)?;
        let Some(item) = item.as_object() else {
            warn!(path, "path item is not an object, skipping");
            continue;
        };
        let path_params = item
            .get("parameters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (key, operation) in item {
            let Some(method) = METHOD_KEYS.iter().find(|(k, _)| *k == key.as_str()).map(|(_, m)| *m) else {
                continue;
            };
            if let Some(sel) = selected {
                if sel.path != *path || sel.method != method {
                    continue;
                }
            }
            let Some(operation) = operation.as_object() else {
                continue;
            };
            let hints = plugin_operations.get(path).and_then(|m| m.get(method));

            let mut function = compile_operation(server_url, path, method, operation, &path_params, hints)?;
            function.name = unique_name(function.name, &mut seen_names);
            debug!(function = %function.name, "compiled operation");
            functions.push(function);
        }
    }
    Ok(functions)
}

fn unique_name(name: String, seen: &mut HashMap<String, usize>) -> String {
    let count = seen.entry(name.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        return name;
    }
    let mut n = *count;
    loop {
        let suffix = format!("_{n}");
        let base: String = name.chars().take(MAX_FUNCTION_NAME_LEN - suffix.len()).collect();
        let candidate = format!("{base}{suffix}");
        if !seen.contains_key(&candidate) {
            warn!(original = %name, renamed = %candidate, "duplicate function name after sanitizing");
            seen.insert(candidate.clone(), 1);
            return candidate;
        }
        n += 1;
    }
}

fn compile_operation(
    server_url: &str,
    path: &str,
    method: &str,
    operation: &Map<String, Value>,
    path_params: &[Value],
    hints: Option<&PluginOperation>,
) -> Result<Function, OpenApiParseError> {
    let summary = operation.get("summary").and_then(Value::as_str).unwrap_or_default();
    let op_description = operation.get("description").and_then(Value::as_str).unwrap_or_default();
    let mut description = if op_description.is_empty() {
        summary.to_string()
    } else {
        op_description.to_string()
    };

    let manifest_deps = hints.map(|h| &h.x_dependent_parameters);
    let mut properties = Vec::new();

    // 1) parameters, operation level overriding path level on (name, in)
    let op_params = operation
        .get("parameters")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut merged: Vec<Value> = path_params.to_vec();
    for param in op_params {
        let key = param_key(&param);
        match merged.iter_mut().find(|p| param_key(p) == key) {
            Some(existing) => *existing = param,
            None => merged.push(param),
        }
    }
    for param in &merged {
        if let Some(prop) = parameter_property(param, manifest_deps) {
            properties.push(prop);
        }
    }

    // 2) request body
    let mut body_media_type = None;
    if let Some(body) = operation.get("requestBody").and_then(Value::as_object) {
        let body_required = body.get("required").and_then(Value::as_bool).unwrap_or(false);
        let content = body.get("content").and_then(Value::as_object);
        if let Some(content) = content.filter(|c| !c.is_empty()) {
            match BODY_MEDIA_TYPES.iter().find(|m| content.contains_key(**m)) {
                Some(media) => {
                    let schema = content
                        .get(*media)
                        .and_then(|c| c.get("schema"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    properties.extend(body_properties(&schema, body_required, manifest_deps));
                    body_media_type = Some(media.to_string());
                }
                None if body_required => {
                    return Err(OpenApiParseError::UnsupportedMediaType {
                        path: path.to_string(),
                        method: method.to_string(),
                        media_types: content.keys().cloned().collect(),
                    });
                }
                None => {
                    warn!(path, method, media_types = ?content.keys().collect::<Vec<_>>(), "skipping optional request body with unsupported media type");
                }
            }
        }
    }

    // 3) manifest hints
    let mut x_dependent_parameter_map = BTreeMap::new();
    for prop in &properties {
        if let Some(key) = &prop.x_dependent {
            x_dependent_parameter_map.insert(prop.name.clone(), key.clone());
        }
    }
    let (human_usage_examples, signature_helpers, few_shot_examples) = match hints {
        Some(h) => (
            h.human_usage_examples.clone(),
            h.plugin_signature_helpers.clone(),
            h.few_shot_examples.clone(),
        ),
        None => Default::default(),
    };
    for helper in &signature_helpers {
        let helper = helper.trim();
        if helper.is_empty() || helper == op_description || helper == summary {
            continue;
        }
        if !description.is_empty() {
            description.push('\n');
        }
        description.push_str(helper);
    }

    let url = join_url(server_url, path);
    Ok(Function {
        name: sanitize(&format!("{method}{path}")),
        description,
        path: path.to_string(),
        method: method.to_string(),
        api: ApiInfo {
            url,
            method: method.to_string(),
        },
        param_type: "object".to_string(),
        param_properties: properties,
        x_dependent_parameter_map,
        human_usage_examples,
        signature_helpers,
        few_shot_examples,
        body_media_type,
    })
}

fn param_key(param: &Value) -> (Option<&str>, Option<&str>) {
    (
        param.get("name").and_then(Value::as_str),
        param.get("in").and_then(Value::as_str),
    )
}

fn parameter_property(
    param: &Value,
    manifest_deps: Option<&BTreeMap<String, OperationKey>>,
) -> Option<FunctionProperty> {
    let name = param.get("name").and_then(Value::as_str)?;
    let location_raw = param.get("in").and_then(Value::as_str).unwrap_or("query");
    let Some(location) = PropertyLocation::from_openapi(location_raw) else {
        warn!(name, location = location_raw, "unknown parameter location, skipping");
        return None;
    };
    let schema = param.get("schema").cloned().unwrap_or(Value::Null);
    let mut prop = schema_property(name, &schema, location);

    if let Some(d) = param.get("description").and_then(Value::as_str) {
        prop.description = Some(d.to_string());
    }
    if let Some(example) = param.get("example") {
        prop.example = Some(example.clone());
    } else if prop.example.is_none() {
        prop.example = param
            .get("examples")
            .and_then(Value::as_object)
            .and_then(|m| m.values().next())
            .and_then(|e| e.get("value"))
            .cloned();
    }
    prop.required = location == PropertyLocation::Path
        || param.get("required").and_then(Value::as_bool).unwrap_or(false);
    prop.x_dependent = dependent_key(param)
        .or_else(|| dependent_key(&schema))
        .or_else(|| manifest_deps.and_then(|m| m.get(name)).cloned());
    Some(prop)
}

fn body_properties(
    schema: &Value,
    body_required: bool,
    manifest_deps: Option<&BTreeMap<String, OperationKey>>,
) -> Vec<FunctionProperty> {
    let (properties, required) = object_shape(schema);
    let Some(properties) = properties else {
        let mut prop = schema_property("body", schema, PropertyLocation::Body);
        prop.required = body_required;
        return vec![prop];
    };

    properties
        .iter()
        .map(|(name, prop_schema)| {
            let mut prop = schema_property(name, prop_schema, PropertyLocation::Body);
            prop.required = required.iter().any(|r| r == name);
            prop.x_dependent = dependent_key(prop_schema)
                .or_else(|| manifest_deps.and_then(|m| m.get(name)).cloned());
            prop
        })
        .collect()
}

/// `(properties, required)` of an object schema, merging `allOf` members in order.
fn object_shape(schema: &Value) -> (Option<Map<String, Value>>, Vec<String>) {
    let mut properties: Option<Map<String, Value>> = None;
    let mut required = Vec::new();

    if let Some(parts) = schema.get("allOf").and_then(Value::as_array) {
        for part in parts {
            let (props, req) = object_shape(part);
            if let Some(props) = props {
                properties.get_or_insert_with(Map::new).extend(props);
            }
            required.extend(req);
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        properties.get_or_insert_with(Map::new).extend(props.clone());
    }
    if let Some(req) = schema.get("required").and_then(Value::as_array) {
        required.extend(req.iter().filter_map(Value::as_str).map(str::to_string));
    }
    (properties, required)
}

fn schema_property(name: &str, schema: &Value, location: PropertyLocation) -> FunctionProperty {
    let prop_type = match schema.get("type") {
        Some(Value::String(t)) => t.clone(),
        // OpenAPI 3.1 allows ["string", "null"]
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("string")
            .to_string(),
        _ if schema.get("properties").is_some() || schema.get("allOf").is_some() => "object".to_string(),
        _ => "string".to_string(),
    };
    let mut prop = FunctionProperty::new(name, prop_type, location);
    let str_field = |k: &str| schema.get(k).and_then(Value::as_str).map(str::to_string);

    prop.description = str_field("description");
    prop.format = str_field("format");
    prop.pattern = str_field("pattern");
    prop.enum_values = schema.get("enum").and_then(Value::as_array).cloned();
    prop.example = schema
        .get("example")
        .cloned()
        .or_else(|| schema.get("examples").and_then(Value::as_array).and_then(|e| e.first().cloned()));
    prop.default = schema.get("default").cloned();
    prop.min_length = schema.get("minLength").and_then(Value::as_u64);
    prop.max_length = schema.get("maxLength").and_then(Value::as_u64);
    prop.minimum = schema.get("minimum").cloned();
    prop.maximum = schema.get("maximum").cloned();
    prop.items = schema.get("items").cloned();
    prop.read_only = schema.get("readOnly").and_then(Value::as_bool).unwrap_or(false);
    prop.write_only = schema.get("writeOnly").and_then(Value::as_bool).unwrap_or(false);
    prop
}

fn dependent_key(value: &Value) -> Option<OperationKey> {
    let dep = value.get("x-dependent")?;
    let path = dep.get("path").and_then(Value::as_str)?;
    let method = dep.get("method").and_then(Value::as_str).unwrap_or("get");
    Some(OperationKey::new(path, method))
}
