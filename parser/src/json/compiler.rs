use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::formats::lookup_format;
use super::merge::merge_schemas;
use super::numeric::{rx_float_range, rx_int_range};
use crate::{rx::regex_to_node, GrammarBuilder, NodeRef};

/// How JSON text produced under a schema must be laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonCompileOptions {
    /// `None`: any JSON whitespace around structural characters (unless
    /// `separators` are given). `Some(n)`: the exact layout of a pretty
    /// printer indenting by `n` spaces.
    pub indent: Option<usize>,
    /// Item and key separators, e.g. `(",", ":")`.
    pub separators: Option<(String, String)>,
    pub strict_properties_order: bool,
    /// Whether objects without an `additionalProperties` keyword (and
    /// arrays with `prefixItems` but no `items`) accept extra members.
    pub allow_additional_properties: bool,
    /// Cap on each run of flexible whitespace.
    pub max_whitespace: Option<usize>,
    /// Check the schema against its meta-schema before compiling.
    pub validate_schema: bool,
}

impl Default for JsonCompileOptions {
    fn default() -> Self {
        Self {
            indent: None,
            separators: None,
            strict_properties_order: true,
            allow_additional_properties: false,
            max_whitespace: None,
            validate_schema: false,
        }
    }
}

impl JsonCompileOptions {
    /// Single-line output with exactly these separators.
    pub fn compact(item_separator: &str, key_separator: &str) -> Self {
        Self {
            separators: Some((item_separator.to_string(), key_separator.to_string())),
            ..Self::default()
        }
    }

    pub fn indented(indent: usize) -> Self {
        Self {
            indent: Some(indent),
            ..Self::default()
        }
    }
}

enum Layout {
    Flexible,
    Compact { item_sep: String, key_sep: String },
    Indented { indent: usize, item_sep: String, key_sep: String },
}

// indentation is exact up to this depth; deeper values reuse its layout
const MAX_INDENT_DEPTH: usize = 16;
const MAX_UNORDERED_PROPERTIES: usize = 8;
const MAX_REF_CHAIN: usize = 100;

const TYPES: [&str; 7] = ["null", "boolean", "integer", "number", "string", "array", "object"];
const KEYWORDS: [&str; 7] = ["anyOf", "oneOf", "allOf", "$ref", "const", "enum", "type"];
pub(crate) const IGNORED_KEYS: [&str; 21] = [
    "$schema",
    "$id",
    "id",
    "$comment",
    "$anchor",
    "title",
    "description",
    "default",
    "examples",
    "example",
    "deprecated",
    "readOnly",
    "writeOnly",
    "discriminator",
    "dependencies",
    "contentMediaType",
    "contentEncoding",
    "markdownDescription",
    "enumDescriptions",
    "deprecationMessage",
    "nullable",
];
// these are also just ignored
const DEFS_KEYS: [&str; 2] = ["$defs", "definitions"];
const UNIMPLEMENTED_KEYS: [&str; 16] = [
    "not",
    "if",
    "then",
    "else",
    "multipleOf",
    "patternProperties",
    "propertyNames",
    "minProperties",
    "maxProperties",
    "uniqueItems",
    "contains",
    "minContains",
    "maxContains",
    "dependentRequired",
    "dependentSchemas",
    "unevaluatedProperties",
];

const ARRAY_KEYS: [&str; 5] = ["items", "prefixItems", "additionalItems", "minItems", "maxItems"];
const OBJECT_KEYS: [&str; 3] = ["properties", "additionalProperties", "required"];
const STRING_KEYS: [&str; 4] = ["minLength", "maxLength", "pattern", "format"];
const NUMERIC_KEYS: [&str; 4] = ["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"];

const CHAR_REGEX: &str = r#"(\\(["\\/bfnrt]|u[a-fA-F0-9]{4})|[^"\\\x00-\x1F\x7F])"#;

pub(crate) fn limited_str(node: &Value) -> String {
    let s = node.to_string();
    if s.len() > 100 {
        let mut end = 100;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s
    }
}

fn is_ignored_key(key: &str) -> bool {
    IGNORED_KEYS.contains(&key)
        || DEFS_KEYS.contains(&key)
        || key.starts_with("x-")
        || key.starts_with("$xsd-")
}

fn validate_json_node_keys(node: &Map<String, Value>) -> Result<()> {
    for key in node.keys() {
        let key = key.as_str();
        if KEYWORDS.contains(&key)
            || ARRAY_KEYS.contains(&key)
            || OBJECT_KEYS.contains(&key)
            || STRING_KEYS.contains(&key)
            || NUMERIC_KEYS.contains(&key)
            || is_ignored_key(key)
        {
            continue;
        }
        if UNIMPLEMENTED_KEYS.contains(&key) {
            bail!("Unimplemented key in JSON schema: {:?}", key);
        }
        bail!("Unknown key in JSON schema: {:?}", key);
    }
    Ok(())
}

trait OptionalField {
    fn opt_u64(&self, key: &str) -> Result<Option<u64>>;
    fn opt_f64(&self, key: &str) -> Result<Option<f64>>;
    fn opt_str(&self, key: &str) -> Result<Option<&str>>;
    fn opt_array(&self, key: &str) -> Result<Option<&Vec<Value>>>;
    fn opt_object(&self, key: &str) -> Result<Option<&Map<String, Value>>>;
}

fn expected_err(key: &str, val: &Value, expected: &str) -> anyhow::Error {
    anyhow!(
        "Expected {} for field {:?}, got: {}",
        expected,
        key,
        limited_str(val)
    )
}

impl OptionalField for Value {
    fn opt_u64(&self, key: &str) -> Result<Option<u64>> {
        if let Some(val) = self.get(key) {
            val.as_u64()
                .ok_or_else(|| expected_err(key, val, "unsigned integer"))
                .map(Some)
        } else {
            Ok(None)
        }
    }

    fn opt_f64(&self, key: &str) -> Result<Option<f64>> {
        if let Some(val) = self.get(key) {
            val.as_f64()
                .ok_or_else(|| expected_err(key, val, "number"))
                .map(Some)
        } else {
            Ok(None)
        }
    }

    fn opt_str(&self, key: &str) -> Result<Option<&str>> {
        if let Some(val) = self.get(key) {
            val.as_str()
                .ok_or_else(|| expected_err(key, val, "string"))
                .map(Some)
        } else {
            Ok(None)
        }
    }

    fn opt_array(&self, key: &str) -> Result<Option<&Vec<Value>>> {
        if let Some(val) = self.get(key) {
            val.as_array()
                .ok_or_else(|| expected_err(key, val, "array"))
                .map(Some)
        } else {
            Ok(None)
        }
    }

    fn opt_object(&self, key: &str) -> Result<Option<&Map<String, Value>>> {
        if let Some(val) = self.get(key) {
            val.as_object()
                .ok_or_else(|| expected_err(key, val, "object"))
                .map(Some)
        } else {
            Ok(None)
        }
    }
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let b = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| anyhow!("invalid percent-encoding in {:?}", s))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| anyhow!("invalid UTF-8 in {:?}", s))
}

/// Resolves `#` and `#/json/pointer` references against the root schema.
fn resolve_ref<'a>(root: &'a Value, reference: &str) -> Result<&'a Value> {
    if reference == "#" {
        return Ok(root);
    }
    let ptr = match reference.strip_prefix('#') {
        Some(p) if p.starts_with('/') => p,
        _ => bail!(
            "Unsupported $ref (only local references are supported): {}",
            reference
        ),
    };
    let ptr = percent_decode(ptr)?;
    root.pointer(&ptr)
        .ok_or_else(|| anyhow!("Unresolved $ref: {}", reference))
}

fn has_constraints(obj: &Map<String, Value>, except: &[&str]) -> bool {
    obj.keys()
        .any(|k| !except.contains(&k.as_str()) && !is_ignored_key(k))
}

/// Inlines `$ref` and `allOf` at the top of `schema`, intersecting the
/// pieces with the remaining keywords.
fn flatten(root: &Value, schema: &Value, fuel: usize) -> Result<Value> {
    let obj = match schema.as_object() {
        Some(obj) if obj.contains_key("$ref") || obj.contains_key("allOf") => obj,
        _ => return Ok(schema.clone()),
    };
    ensure!(fuel > 0, "$ref chain too long");
    let mut base = obj.clone();
    let reference = base.remove("$ref");
    let all_of = base.remove("allOf");
    let mut res = Value::Object(base);
    if let Some(reference) = reference {
        let reference = reference
            .as_str()
            .ok_or_else(|| anyhow!("Expected string in $ref, got: {}", limited_str(&reference)))?;
        let target = resolve_ref(root, reference)?;
        let target = flatten(root, target, fuel - 1)?;
        res = merge_schemas(&res, &target)?;
    }
    if let Some(all_of) = all_of {
        let list = all_of
            .as_array()
            .ok_or_else(|| anyhow!("Expected array in allOf, got: {}", limited_str(&all_of)))?;
        for sub in list {
            let sub = flatten(root, sub, fuel - 1)?;
            res = merge_schemas(&res, &sub)?;
        }
    }
    // merging may surface a $ref or allOf from the pieces
    flatten(root, &res, fuel - 1)
}

fn schema_types(schema: &Value) -> Result<Vec<String>> {
    match schema.get("type") {
        Some(Value::String(s)) => return Ok(vec![s.clone()]),
        Some(Value::Array(arr)) => {
            return arr
                .iter()
                .map(|v| {
                    v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        anyhow!("Expected string in type list, got: {}", limited_str(v))
                    })
                })
                .collect()
        }
        Some(v) => bail!("Expected string or array for 'type', got: {}", limited_str(v)),
        None => {}
    }

    let has = |keys: &[&str]| keys.iter().any(|k| schema.get(*k).is_some());
    let mut types = vec![];
    if has(&NUMERIC_KEYS) {
        types.push("number".to_string());
    }
    if has(&STRING_KEYS) {
        types.push("string".to_string());
    }
    if has(&ARRAY_KEYS) {
        types.push("array".to_string());
    }
    if has(&OBJECT_KEYS) {
        types.push("object".to_string());
    }
    if types.is_empty() {
        types = TYPES.iter().map(|s| s.to_string()).collect();
    }
    Ok(types)
}

fn int_bound(v: f64) -> Result<i64> {
    ensure!(
        v.is_finite() && v.abs() < 9.0e18,
        "integer bound {} out of range",
        v
    );
    Ok(v as i64)
}

pub(crate) struct Compiler<'a> {
    builder: &'a mut GrammarBuilder,
    options: JsonCompileOptions,
    layout: Layout,
    root: Value,
    definitions: HashMap<(String, usize), NodeRef>,
    pending_definitions: Vec<(String, usize, NodeRef)>,
    pub(crate) warnings: Vec<String>,

    any_cache: HashMap<usize, NodeRef>,
    rx_cache: HashMap<String, NodeRef>,
    string_char: Option<NodeRef>,
    ws_cache: Option<NodeRef>,
}

impl<'a> Compiler<'a> {
    pub fn new(builder: &'a mut GrammarBuilder, options: &JsonCompileOptions) -> Self {
        let (item_sep, key_sep) = options.separators.clone().unwrap_or_else(|| {
            if options.indent.is_some() {
                (",".to_string(), ": ".to_string())
            } else {
                (",".to_string(), ":".to_string())
            }
        });
        let layout = match (options.indent, &options.separators) {
            (Some(indent), _) => Layout::Indented {
                indent,
                item_sep,
                key_sep,
            },
            (None, Some(_)) => Layout::Compact { item_sep, key_sep },
            (None, None) => Layout::Flexible,
        };
        Self {
            builder,
            options: options.clone(),
            layout,
            root: Value::Null,
            definitions: HashMap::new(),
            pending_definitions: vec![],
            warnings: vec![],
            any_cache: HashMap::new(),
            rx_cache: HashMap::new(),
            string_char: None,
            ws_cache: None,
        }
    }

    /// Compiles `schema`; `$ref`s resolve against it.
    pub fn execute(&mut self, schema: &Value) -> Result<NodeRef> {
        if self.options.validate_schema {
            if let Err(e) = jsonschema::JSONSchema::compile(schema) {
                bail!("Invalid JSON schema: {}", e);
            }
        }

        self.root = schema.clone();
        let root = self.gen_json(schema, 0)?;

        while let Some((reference, depth, placeholder)) = self.pending_definitions.pop() {
            let node = resolve_ref(&self.root, &reference)?.clone();
            let compiled = self
                .gen_json(&node, depth)
                .with_context(|| format!("in definition {}", reference))?;
            self.builder.set_placeholder(placeholder, compiled)?;
            self.builder.check_size()?;
        }

        self.builder.check_size()?;
        Ok(root)
    }

    fn depth_key(&self, depth: usize) -> usize {
        match self.layout {
            Layout::Indented { .. } => depth.min(MAX_INDENT_DEPTH),
            _ => 0,
        }
    }

    fn ws(&mut self) -> Result<NodeRef> {
        if let Some(ws) = self.ws_cache {
            return Ok(ws);
        }
        let ws = match self.layout {
            Layout::Flexible => {
                let ch = self.builder.char_ranges(&[(0x09, 0x0A), (0x0D, 0x0D), (0x20, 0x20)]);
                self.builder.repeat(ch, 0, self.options.max_whitespace)?
            }
            _ => self.builder.empty(),
        };
        self.ws_cache = Some(ws);
        Ok(ws)
    }

    fn newline(&mut self, indent: usize, depth: usize) -> NodeRef {
        let s = format!("\n{}", " ".repeat(indent * depth));
        self.builder.string(&s)
    }

    /// Separator between items of a container at `depth`.
    fn item_sep(&mut self, depth: usize) -> Result<NodeRef> {
        Ok(match &self.layout {
            Layout::Flexible => {
                let ws = self.ws()?;
                let comma = self.builder.string(",");
                self.builder.join(&[ws, comma, ws])
            }
            Layout::Compact { item_sep, .. } => {
                let s = item_sep.clone();
                self.builder.string(&s)
            }
            Layout::Indented {
                indent, item_sep, ..
            } => {
                let s = format!("{}\n{}", item_sep, " ".repeat(indent * (depth + 1)));
                self.builder.string(&s)
            }
        })
    }

    fn key_sep(&mut self) -> Result<NodeRef> {
        Ok(match &self.layout {
            Layout::Flexible => {
                let ws = self.ws()?;
                let colon = self.builder.string(":");
                self.builder.join(&[ws, colon, ws])
            }
            Layout::Compact { key_sep, .. } | Layout::Indented { key_sep, .. } => {
                let s = key_sep.clone();
                self.builder.string(&s)
            }
        })
    }

    fn empty_container(&mut self, open: &str, close: &str) -> Result<NodeRef> {
        Ok(match self.layout {
            Layout::Flexible => {
                let ws = self.ws()?;
                let open = self.builder.string(open);
                let close = self.builder.string(close);
                self.builder.join(&[open, ws, close])
            }
            _ => self.builder.string(&format!("{}{}", open, close)),
        })
    }

    /// `open body close`, with `body` holding at least one item.
    fn container(&mut self, open: &str, body: NodeRef, close: &str, depth: usize) -> Result<NodeRef> {
        let (after_open, before_close) = match self.layout {
            Layout::Flexible => {
                let ws = self.ws()?;
                (ws, ws)
            }
            Layout::Compact { .. } => {
                let e = self.builder.empty();
                (e, e)
            }
            Layout::Indented { indent, .. } => (
                self.newline(indent, depth + 1),
                self.newline(indent, depth),
            ),
        };
        let open = self.builder.string(open);
        let close = self.builder.string(close);
        Ok(self.builder.join(&[open, after_open, body, before_close, close]))
    }

    fn process_any_of(&mut self, options: &Value, depth: usize) -> Result<NodeRef> {
        let arr = options
            .as_array()
            .ok_or_else(|| anyhow!("Expected array in anyOf, got: {}", limited_str(options)))?;
        let nodes = arr
            .iter()
            .map(|json_schema| self.gen_json(json_schema, depth))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.builder.select(&nodes))
    }

    fn gen_json(&mut self, json_schema: &Value, depth: usize) -> Result<NodeRef> {
        let depth = self.depth_key(depth);

        let obj = match json_schema {
            Value::Bool(true) => return self.gen_json_any(depth),
            Value::Bool(false) => return Ok(self.builder.nothing()),
            Value::Object(obj) => obj,
            _ => bail!(
                "Expected object or boolean as json schema, got: {}",
                limited_str(json_schema)
            ),
        };

        validate_json_node_keys(obj)?;

        if !has_constraints(obj, &[]) {
            return self.gen_json_any(depth);
        }

        if obj.contains_key("allOf")
            || (obj.contains_key("$ref") && has_constraints(obj, &["$ref"]))
        {
            let merged = flatten(&self.root, json_schema, MAX_REF_CHAIN)?;
            return self.gen_json(&merged, depth);
        }

        if let Some(reference) = obj.get("$ref") {
            let reference = reference
                .as_str()
                .ok_or_else(|| anyhow!("Expected string in $ref, got: {}", limited_str(reference)))?;
            return Ok(self.get_definition(reference, depth));
        }

        for key in ["anyOf", "oneOf"] {
            if let Some(options) = obj.get(key) {
                if has_constraints(obj, &[key]) {
                    // push the sibling keywords into every option
                    let mut siblings = obj.clone();
                    siblings.remove(key);
                    let list = options.as_array().ok_or_else(|| {
                        anyhow!("Expected array in {}, got: {}", key, limited_str(options))
                    })?;
                    let distributed = list
                        .iter()
                        .map(|opt| json!({"allOf": [siblings, opt]}))
                        .collect::<Vec<_>>();
                    return self.process_any_of(&Value::Array(distributed), depth);
                }
                return self.process_any_of(options, depth);
            }
        }

        if let Some(const_value) = obj.get("const") {
            return self.gen_json_const(const_value, depth);
        }

        if let Some(enum_array) = json_schema.opt_array("enum")? {
            ensure!(!enum_array.is_empty(), "empty enum");
            let options = enum_array
                .iter()
                .map(|opt| self.gen_json_const(opt, depth))
                .collect::<Result<Vec<_>>>()?;
            return Ok(self.builder.select(&options));
        }

        let types = schema_types(json_schema)?;
        let nodes = types
            .iter()
            .map(|tp| self.gen_json_type(tp, json_schema, depth))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.builder.select(&nodes))
    }

    fn gen_json_const(&mut self, const_value: &Value, depth: usize) -> Result<NodeRef> {
        // structured constants follow the layout like any other value
        match const_value {
            Value::Object(values) => {
                let properties = values
                    .iter()
                    .map(|(k, v)| (k.clone(), json!({ "const": v })))
                    .collect::<Map<_, _>>();
                let required = properties.keys().cloned().collect();
                self.gen_json_object(&properties, &Value::Bool(false), required, depth)
            }
            Value::Array(values) => {
                let prefix_items = values
                    .iter()
                    .map(|v| json!({ "const": v }))
                    .collect::<Vec<_>>();
                let n = values.len() as u64;
                self.gen_json_array(&prefix_items, &Value::Bool(false), n, Some(n), depth)
            }
            _ => Ok(self.builder.string(&const_value.to_string())),
        }
    }

    fn gen_json_type(&mut self, target_type_str: &str, json_schema: &Value, depth: usize) -> Result<NodeRef> {
        match target_type_str {
            "null" => Ok(self.builder.string("null")),
            "boolean" => {
                let t = self.builder.string("true");
                let f = self.builder.string("false");
                Ok(self.builder.select(&[t, f]))
            }
            "integer" | "number" => {
                let mut minimum = json_schema.opt_f64("minimum")?;
                let mut maximum = json_schema.opt_f64("maximum")?;
                let exclusive_minimum = match json_schema.get("exclusiveMinimum") {
                    // draft 4 boolean
                    Some(Value::Bool(b)) => *b,
                    Some(v @ Value::Number(_)) => {
                        let n = v
                            .as_f64()
                            .ok_or_else(|| expected_err("exclusiveMinimum", v, "number"))?;
                        match minimum {
                            Some(min) if n < min => false,
                            _ => {
                                minimum = Some(n);
                                true
                            }
                        }
                    }
                    Some(v) => return Err(expected_err("exclusiveMinimum", v, "number or boolean")),
                    None => false,
                };
                let exclusive_maximum = match json_schema.get("exclusiveMaximum") {
                    Some(Value::Bool(b)) => *b,
                    Some(v @ Value::Number(_)) => {
                        let n = v
                            .as_f64()
                            .ok_or_else(|| expected_err("exclusiveMaximum", v, "number"))?;
                        match maximum {
                            Some(max) if n > max => false,
                            _ => {
                                maximum = Some(n);
                                true
                            }
                        }
                    }
                    Some(v) => return Err(expected_err("exclusiveMaximum", v, "number or boolean")),
                    None => false,
                };
                if target_type_str == "integer" {
                    self.json_int(minimum, maximum, exclusive_minimum, exclusive_maximum)
                } else {
                    self.json_number(minimum, maximum, exclusive_minimum, exclusive_maximum)
                }
            }
            "string" => {
                let min_length = json_schema.opt_u64("minLength")?.unwrap_or(0);
                let max_length = json_schema.opt_u64("maxLength")?;
                let pattern = json_schema.opt_str("pattern")?;
                let format = json_schema.opt_str("format")?;
                self.gen_json_string(min_length, max_length, pattern, format)
            }
            "array" => {
                let additional_default = Value::Bool(self.options.allow_additional_properties);
                let (prefix_items, item_schema) = match json_schema.get("items") {
                    // legacy tuple form
                    Some(Value::Array(items)) => (
                        items.clone(),
                        json_schema
                            .get("additionalItems")
                            .cloned()
                            .unwrap_or(additional_default),
                    ),
                    items => {
                        let prefix = json_schema.opt_array("prefixItems")?.cloned();
                        let item_schema = match (items, &prefix) {
                            (Some(items), _) => items.clone(),
                            (None, Some(_)) => additional_default,
                            (None, None) => Value::Bool(true),
                        };
                        (prefix.unwrap_or_default(), item_schema)
                    }
                };
                let min_items = json_schema.opt_u64("minItems")?.unwrap_or(0);
                let max_items = json_schema.opt_u64("maxItems")?;
                self.gen_json_array(&prefix_items, &item_schema, min_items, max_items, depth)
            }
            "object" => {
                let empty = Map::default();
                let properties = json_schema.opt_object("properties")?.unwrap_or(&empty);
                let additional_properties = json_schema
                    .get("additionalProperties")
                    .cloned()
                    .unwrap_or(Value::Bool(self.options.allow_additional_properties));
                let required: Vec<String> = json_schema
                    .opt_array("required")?
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| {
                                v.as_str()
                                    .map(|s| s.to_string())
                                    .ok_or_else(|| expected_err("required", v, "array of string"))
                            })
                            .collect::<Result<Vec<_>>>()
                    })
                    .unwrap_or_else(|| Ok(vec![]))?;
                self.gen_json_object(properties, &additional_properties, required, depth)
            }
            _ => bail!("Unsupported type in schema: {}", target_type_str),
        }
    }

    fn rx_node(&mut self, rx: &str, json_quoted: bool) -> Result<NodeRef> {
        let key = format!("{}{}", if json_quoted { "q:" } else { "r:" }, rx);
        if let Some(n) = self.rx_cache.get(&key) {
            return Ok(*n);
        }
        let n = regex_to_node(self.builder, rx, json_quoted)?;
        self.rx_cache.insert(key, n);
        Ok(n)
    }

    fn json_int(
        &mut self,
        minimum: Option<f64>,
        maximum: Option<f64>,
        exclusive_minimum: bool,
        exclusive_maximum: bool,
    ) -> Result<NodeRef> {
        let minimum = match (minimum, exclusive_minimum) {
            (Some(min_val), true) => {
                if min_val.fract() != 0.0 {
                    Some(min_val.ceil())
                } else {
                    Some(min_val + 1.0)
                }
            }
            (Some(min_val), false) => Some(min_val.ceil()),
            _ => None,
        }
        .map(int_bound)
        .transpose()?;
        let maximum = match (maximum, exclusive_maximum) {
            (Some(max_val), true) => {
                if max_val.fract() != 0.0 {
                    Some(max_val.floor())
                } else {
                    Some(max_val - 1.0)
                }
            }
            (Some(max_val), false) => Some(max_val.floor()),
            _ => None,
        }
        .map(int_bound)
        .transpose()?;
        let rx = rx_int_range(minimum, maximum)?;
        self.rx_node(&rx, false)
    }

    fn json_number(
        &mut self,
        minimum: Option<f64>,
        maximum: Option<f64>,
        exclusive_minimum: bool,
        exclusive_maximum: bool,
    ) -> Result<NodeRef> {
        let rx = rx_float_range(minimum, maximum, !exclusive_minimum, !exclusive_maximum)?;
        self.rx_node(&rx, false)
    }

    fn json_string_char(&mut self) -> Result<NodeRef> {
        if let Some(c) = self.string_char {
            return Ok(c);
        }
        let c = regex_to_node(self.builder, CHAR_REGEX, false)?;
        self.string_char = Some(c);
        Ok(c)
    }

    fn quoted(&mut self, body: NodeRef) -> NodeRef {
        let q = self.builder.string("\"");
        self.builder.join(&[q, body, q])
    }

    fn json_simple_string(&mut self) -> Result<NodeRef> {
        let key = "simple_string".to_string();
        if let Some(n) = self.rx_cache.get(&key) {
            return Ok(*n);
        }
        let c = self.json_string_char()?;
        let body = self.builder.zero_or_more(c);
        let n = self.quoted(body);
        self.rx_cache.insert(key, n);
        Ok(n)
    }

    fn gen_json_string(
        &mut self,
        min_length: u64,
        max_length: Option<u64>,
        regex: Option<&str>,
        format: Option<&str>,
    ) -> Result<NodeRef> {
        let mut regex = regex.map(|s| s.to_string());

        if let Some(format) = format {
            if regex.is_some() {
                bail!("Cannot specify both a regex and a format for a JSON string");
            }
            if let Some(r) = lookup_format(format) {
                regex = Some(r.to_string());
            } else {
                self.warnings
                    .push(format!("Unknown format {:?}, treating as plain string", format));
            }
        }

        if let Some(max_length) = max_length {
            ensure!(
                min_length <= max_length,
                "minLength ({}) is greater than maxLength ({})",
                min_length,
                max_length
            );
        }

        if let Some(regex) = regex {
            if min_length > 0 || max_length.is_some() {
                bail!("If a pattern is specified, minLength and maxLength must be unspecified.");
            }
            let body = self.rx_node(&regex, true)?;
            return Ok(self.quoted(body));
        }

        if min_length == 0 && max_length.is_none() {
            return self.json_simple_string();
        }

        let c = self.json_string_char()?;
        let body = self
            .builder
            .repeat(c, min_length as usize, max_length.map(|v| v as usize))?;
        Ok(self.quoted(body))
    }

    fn get_definition(&mut self, reference: &str, depth: usize) -> NodeRef {
        let key = (reference.to_string(), depth);
        if let Some(definition) = self.definitions.get(&key) {
            return *definition;
        }
        let r = self.builder.placeholder();
        self.definitions.insert(key, r);
        self.pending_definitions
            .push((reference.to_string(), depth, r));
        r
    }

    fn gen_json_any(&mut self, depth: usize) -> Result<NodeRef> {
        if let Some(n) = self.any_cache.get(&depth) {
            return Ok(*n);
        }
        let json_any = self.builder.placeholder();
        self.any_cache.insert(depth, json_any); // avoid infinite recursion
        let all_jsons = [
            json!({"type": "null"}),
            json!({"type": "boolean"}),
            json!({"type": "number"}),
            json!({"type": "string"}),
            json!({"type": "array", "items": true}),
            json!({"type": "object", "additionalProperties": true}),
        ];
        let ch = all_jsons
            .iter()
            .map(|json_schema| self.gen_json(json_schema, depth))
            .collect::<Result<Vec<_>>>()?;
        let inner = self.builder.select(&ch);
        self.builder.set_placeholder(json_any, inner)?;
        Ok(json_any)
    }

    fn gen_json_object(
        &mut self,
        properties: &Map<String, Value>,
        additional_properties: &Value,
        required: Vec<String>,
        depth: usize,
    ) -> Result<NodeRef> {
        let mut items: Vec<(NodeRef, bool)> = vec![];
        let key_sep = self.key_sep()?;
        for name in properties
            .keys()
            .chain(required.iter().filter(|n| !properties.contains_key(n.as_str())))
        {
            let property_schema = properties.get(name).unwrap_or(additional_properties);
            let is_required = required.contains(name);
            if property_schema == &Value::Bool(false) {
                if is_required {
                    bail!("Required property has 'false' schema: {}", name);
                }
                continue;
            }
            let key = self.builder.string(&Value::String(name.clone()).to_string());
            let value = self
                .gen_json(property_schema, depth + 1)
                .with_context(|| format!("in property {:?}", name))?;
            let item = self.builder.join(&[key, key_sep, value]);
            items.push((item, is_required));
        }

        let additional = if additional_properties != &Value::Bool(false) {
            let key = self.json_simple_string()?;
            let value = self.gen_json(additional_properties, depth + 1)?;
            Some(self.builder.join(&[key, key_sep, value]))
        } else {
            None
        };

        let sep = self.item_sep(depth)?;
        let unordered = !self.options.strict_properties_order && items.len() > 1;
        if unordered && items.len() > MAX_UNORDERED_PROPERTIES {
            self.warnings.push(format!(
                "{} properties are too many for any-order matching, keeping schema order",
                items.len()
            ));
        }
        let body = if unordered && items.len() <= MAX_UNORDERED_PROPERTIES {
            self.unordered_body(&items, additional, sep)?
        } else {
            if let Some(additional) = additional {
                let seq = self.sequence(additional, sep);
                items.push((seq, false));
            }
            self.ordered_body(&items, sep)
        };

        let may_be_empty = !items.iter().any(|(_, req)| *req);
        let full = match body {
            Some(body) => Some(self.container("{", body, "}", depth)?),
            None => None,
        };
        match (full, may_be_empty) {
            (Some(full), true) => {
                let empty = self.empty_container("{", "}")?;
                Ok(self.builder.select(&[empty, full]))
            }
            (Some(full), false) => Ok(full),
            (None, _) => self.empty_container("{", "}"),
        }
    }

    /// Items in the given order, optional ones may be skipped. Returns
    /// `None` when there are no items at all; the result never matches
    /// the empty string.
    fn ordered_body(&mut self, items: &[(NodeRef, bool)], sep: NodeRef) -> Option<NodeRef> {
        // prefixed[i]: items i.. each preceded by a separator
        let mut prefixed = vec![self.builder.empty()];
        for &(item, required) in items.iter().rev() {
            let rest = prefixed[prefixed.len() - 1];
            let node = if required {
                self.builder.join(&[sep, item, rest])
            } else {
                let sep_item = self.builder.join(&[sep, item]);
                let opt = self.builder.optional(sep_item);
                self.builder.join(&[opt, rest])
            };
            prefixed.push(node);
        }
        prefixed.reverse();

        // first[i]: the first present item is one of i..
        let mut first: Option<NodeRef> = None;
        for (i, &(item, required)) in items.iter().enumerate().rev() {
            let this = self.builder.join(&[item, prefixed[i + 1]]);
            first = Some(match (required, first) {
                (false, Some(later)) => self.builder.select(&[this, later]),
                _ => this,
            });
        }
        first
    }

    /// Items in any order, each at most once, required ones mandatory;
    /// `additional` members may appear anywhere.
    fn unordered_body(
        &mut self,
        items: &[(NodeRef, bool)],
        additional: Option<NodeRef>,
        sep: NodeRef,
    ) -> Result<Option<NodeRef>> {
        let mut memo = HashMap::new();
        let mut options = vec![];
        for (i, &(item, _)) in items.iter().enumerate() {
            let rest = self.unordered_rest(items, additional, sep, 1 << i, &mut memo)?;
            options.push(self.builder.join(&[item, rest]));
        }
        if let Some(extra) = additional {
            let rest = self.unordered_rest(items, additional, sep, 0, &mut memo)?;
            options.push(self.builder.join(&[extra, rest]));
        }
        Ok(match options.len() {
            0 => None,
            _ => Some(self.builder.select(&options)),
        })
    }

    // after at least one member, `done` being the emitted properties
    fn unordered_rest(
        &mut self,
        items: &[(NodeRef, bool)],
        additional: Option<NodeRef>,
        sep: NodeRef,
        done: u32,
        memo: &mut HashMap<u32, NodeRef>,
    ) -> Result<NodeRef> {
        if let Some(n) = memo.get(&done) {
            return Ok(*n);
        }
        let node = self.builder.fresh_node("props");
        memo.insert(done, node);
        let mut all_required = true;
        for (i, &(item, required)) in items.iter().enumerate() {
            if done & (1 << i) != 0 {
                continue;
            }
            if required {
                all_required = false;
            }
            let rest = self.unordered_rest(items, additional, sep, done | (1 << i), memo)?;
            self.builder.add_rule(node, &[sep, item, rest])?;
        }
        if let Some(additional) = additional {
            self.builder.add_rule(node, &[sep, additional, node])?;
        }
        if all_required {
            self.builder.add_rule(node, &[])?;
        }
        Ok(node)
    }

    fn sequence(&mut self, item: NodeRef, sep: NodeRef) -> NodeRef {
        let sep_item = self.builder.join(&[sep, item]);
        let tail = self.builder.zero_or_more(sep_item);
        self.builder.join(&[item, tail])
    }

    fn gen_json_array(
        &mut self,
        prefix_items: &[Value],
        item_schema: &Value,
        min_items: u64,
        max_items: Option<u64>,
        depth: usize,
    ) -> Result<NodeRef> {
        let item_schema_is_false = item_schema.as_bool() == Some(false);
        let min_items = min_items as usize;
        let max_items = max_items.map(|v| v as usize);

        if let Some(max_items) = max_items {
            if max_items < min_items {
                bail!(
                    "maxItems ({}) can't be less than minItems ({})",
                    max_items,
                    min_items
                );
            }
        }
        if item_schema_is_false && prefix_items.len() < min_items {
            bail!(
                "PrefixItems has too few elements ({}) to satisfy minItems ({}) but no extra items were allowed",
                prefix_items.len(),
                min_items
            );
        }

        let n_prefix = max_items.map_or(prefix_items.len(), |m| m.min(prefix_items.len()));
        let prefix = prefix_items[..n_prefix]
            .iter()
            .enumerate()
            .map(|(i, s)| {
                self.gen_json(s, depth + 1)
                    .with_context(|| format!("in array item {}", i))
            })
            .collect::<Result<Vec<_>>>()?;

        let extra_max = max_items.map(|m| m - n_prefix);
        let extra = if item_schema_is_false || extra_max == Some(0) {
            None
        } else {
            Some(self.gen_json(item_schema, depth + 1)?)
        };
        let sep = self.item_sep(depth)?;

        let body = if n_prefix > 0 {
            // items past the prefix, each preceded by a separator
            let mut rest = match extra {
                Some(item) => {
                    let sep_item = self.builder.join(&[sep, item]);
                    self.builder
                        .repeat(sep_item, min_items.saturating_sub(n_prefix), extra_max)?
                }
                None => self.builder.empty(),
            };
            for i in (1..n_prefix).rev() {
                let node = self.builder.join(&[sep, prefix[i], rest]);
                rest = if i < min_items {
                    node
                } else {
                    self.builder.optional(node)
                };
            }
            Some(self.builder.join(&[prefix[0], rest]))
        } else if let Some(item) = extra {
            let rest_max = extra_max.map(|m| m - 1);
            let sep_item = self.builder.join(&[sep, item]);
            let rest = self
                .builder
                .repeat(sep_item, min_items.saturating_sub(1), rest_max)?;
            Some(self.builder.join(&[item, rest]))
        } else {
            None
        };

        match body {
            None => self.empty_container("[", "]"),
            Some(body) => {
                let full = self.container("[", body, "]", depth)?;
                if min_items == 0 {
                    let empty = self.empty_container("[", "]")?;
                    Ok(self.builder.select(&[empty, full]))
                } else {
                    Ok(full)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{api::MatcherLimits, earley::Parser};
    use std::sync::Arc;

    fn compile(schema: Value, options: &JsonCompileOptions) -> Result<Parser> {
        let mut builder = GrammarBuilder::new(500_000);
        let root = Compiler::new(&mut builder, options).execute(&schema)?;
        builder.set_start_node(root);
        let g = builder.finalize()?.compile()?;
        Parser::new(Arc::new(g), MatcherLimits::default())
    }

    fn matches(p: &mut Parser, s: &str) -> bool {
        p.reset();
        p.apply_bytes(s.as_bytes()).is_ok() && p.is_accepting()
    }

    fn check(schema: Value, options: &JsonCompileOptions, good: &[&str], bad: &[&str]) {
        let mut p = compile(schema.clone(), options).unwrap();
        for s in good {
            assert!(matches(&mut p, s), "{} should accept {}", schema, s);
        }
        for s in bad {
            assert!(!matches(&mut p, s), "{} should reject {}", schema, s);
        }
    }

    fn compile_err(schema: Value) -> String {
        match compile(schema, &JsonCompileOptions::default()) {
            Ok(_) => panic!("expected compile error"),
            Err(e) => format!("{e:#}"),
        }
    }

    #[test]
    fn object_with_required_integer() {
        check(
            json!({"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}),
            &JsonCompileOptions::default(),
            &[r#"{"a":1}"#, r#"{ "a" : -12 }"#, "{\n  \"a\": 0\n}"],
            &["{}", r#"{"a":1.5}"#, r#"{"a":1,"b":2}"#, r#"{"a":01}"#],
        );
    }

    #[test]
    fn exact_layouts() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "array", "items": {"type": "integer"}}, "b": {"type": "boolean"}},
            "required": ["a", "b"]
        });
        check(
            schema.clone(),
            &JsonCompileOptions::compact(",", ":"),
            &[r#"{"a":[1,2],"b":true}"#, r#"{"a":[],"b":false}"#],
            &[r#"{"a": [1,2],"b":true}"#, r#"{"a":[1, 2],"b":true}"#],
        );
        check(
            schema,
            &JsonCompileOptions::indented(2),
            &[
                "{\n  \"a\": [\n    1,\n    2\n  ],\n  \"b\": true\n}",
                "{\n  \"a\": [],\n  \"b\": false\n}",
            ],
            &[
                r#"{"a":[1,2],"b":true}"#,
                "{\n  \"a\": [1, 2],\n  \"b\": true\n}",
                "{\n\"a\": [],\n\"b\": false\n}",
            ],
        );
    }

    #[test]
    fn optional_and_additional_properties() {
        let schema = json!({
            "properties": {"x": {"type": "null"}, "y": {"type": "null"}, "z": {"type": "null"}},
            "required": ["y"]
        });
        check(
            schema.clone(),
            &JsonCompileOptions::default(),
            &[r#"{"y":null}"#, r#"{"x":null,"y":null,"z":null}"#, r#"{"y":null,"z":null}"#],
            &[r#"{"x":null}"#, r#"{"y":null,"x":null}"#, r#"{"y":null,"w":1}"#],
        );
        let allow = JsonCompileOptions {
            allow_additional_properties: true,
            ..JsonCompileOptions::default()
        };
        check(
            schema.clone(),
            &allow,
            &[r#"{"y":null,"w":[1,{"q":"s"}]}"#],
            &[r#"{"w":1}"#],
        );
        let any_order = JsonCompileOptions {
            strict_properties_order: false,
            ..JsonCompileOptions::default()
        };
        check(
            schema,
            &any_order,
            &[r#"{"y":null,"x":null}"#, r#"{"z":null,"y":null,"x":null}"#],
            &[r#"{"y":null,"y":null}"#, r#"{"x":null,"z":null}"#],
        );
    }

    #[test]
    fn arrays() {
        let opts = JsonCompileOptions::default();
        check(
            json!({"type": "array", "items": {"type": "integer"}, "minItems": 1, "maxItems": 3}),
            &opts,
            &["[1]", "[1,2,3]", "[ 1 , 2 ]"],
            &["[]", "[1,2,3,4]", "[1,]"],
        );
        check(
            json!({"type": "array", "prefixItems": [{"type": "string"}, {"type": "null"}]}),
            &opts,
            &["[]", r#"["a"]"#, r#"["a",null]"#],
            &[r#"["a",null,1]"#, "[null]"],
        );
        check(
            json!({"type": "array", "prefixItems": [{"const": 1}], "items": {"type": "boolean"}, "minItems": 2}),
            &opts,
            &["[1,true]", "[1,false,true]"],
            &["[1]", "[true,true]"],
        );
    }

    #[test]
    fn strings_and_numbers() {
        let opts = JsonCompileOptions::default();
        check(
            json!({"type": "string", "minLength": 2, "maxLength": 3}),
            &opts,
            &[r#""ab""#, r#""a\nb""#, r#""éx""#],
            &[r#""a""#, r#""abcd""#, "\"a\nb\""],
        );
        check(
            json!({"type": "string", "pattern": "^a+\"$"}),
            &opts,
            &[r#""aa\"""#],
            &[r#""aa"""#, r#""b\"""#],
        );
        check(
            json!({"type": "string", "format": "date"}),
            &opts,
            &[r#""2024-02-29""#],
            &[r#""2024-13-01""#],
        );
        check(
            json!({"type": "integer", "exclusiveMinimum": 0, "maximum": 12}),
            &opts,
            &["1", "12"],
            &["0", "13", "-1"],
        );
        check(
            json!({"type": "number", "minimum": -1.5, "maximum": 2}),
            &opts,
            &["-1.5", "0", "1.99", "2"],
            &["-1.6", "2.01"],
        );
    }

    #[test]
    fn combinators_and_refs() {
        let opts = JsonCompileOptions::default();
        check(
            json!({"anyOf": [{"type": "null"}, {"type": "integer"}], "minimum": 3}),
            &opts,
            &["null", "3", "40"],
            &["2", "\"x\""],
        );
        check(
            json!({"allOf": [{"type": "integer", "minimum": 0}, {"maximum": 5}]}),
            &opts,
            &["0", "5"],
            &["6", "-1"],
        );
        check(
            json!({"enum": ["a", 1, [true, null]], "title": "t"}),
            &opts,
            &[r#""a""#, "1", "[true,null]", "[ true , null ]"],
            &[r#""b""#, "[true]"],
        );
        check(
            json!({
                "$defs": {"node": {
                    "type": "object",
                    "properties": {"next": {"anyOf": [{"$ref": "#/$defs/node"}, {"type": "null"}]}},
                    "required": ["next"]
                }},
                "$ref": "#/$defs/node"
            }),
            &opts,
            &[r#"{"next":null}"#, r#"{"next":{"next":{"next":null}}}"#],
            &[r#"{"next":{}}"#],
        );
        check(
            json!({"definitions": {"a b": {"const": 7}}, "type": "array", "items": {"$ref": "#/definitions/a%20b"}}),
            &opts,
            &["[7,7]"],
            &["[8]"],
        );
    }

    #[test]
    fn compile_errors() {
        assert!(compile_err(json!({"type": "banana"})).contains("banana"));
        assert!(compile_err(json!({"type": "integer", "minimum": 5, "maximum": 3})).contains("greater"));
        assert!(compile_err(json!({"type": "string", "minLength": 5, "maxLength": 3})).contains("minLength"));
        assert!(compile_err(json!({"type": "array", "minItems": 5, "maxItems": 3})).contains("maxItems"));
        assert!(compile_err(json!({"enum": []})).contains("empty enum"));
        assert!(compile_err(json!({"$ref": "#/$defs/missing"})).contains("Unresolved"));
        assert!(compile_err(json!({"type": "integer", "multipleOf": 3})).contains("Unimplemented"));
        assert!(compile_err(json!({"allOf": [{"type": "string"}, {"type": "null"}]})).contains("conflicting"));
        assert!(compile_err(json!({
            "type": "object",
            "properties": {"a": false},
            "required": ["a"]
        }))
        .contains("'false' schema"));
        assert!(compile_err(json!({"$ref": "#/$defs/a", "$defs": {"a": {"$ref": "#/$defs/a"}}}))
            .contains("finite string"));
        // a self-referencing definition below the root is not silently dropped
        assert!(compile_err(json!({
            "$defs": {"x": {"$ref": "#/$defs/x"}},
            "type": "object",
            "properties": {"a": {"$ref": "#/$defs/x"}}
        }))
        .contains("unproductive recursion"));
    }

    #[test]
    fn unknown_format_warns() {
        let mut builder = GrammarBuilder::new(100_000);
        let mut c = Compiler::new(&mut builder, &JsonCompileOptions::default());
        c.execute(&json!({"type": "string", "format": "color"})).unwrap();
        assert_eq!(c.warnings.len(), 1);
        assert!(c.warnings[0].contains("color"));
    }
}
