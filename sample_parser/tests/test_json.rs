use grammask::{ErrorKind, JsonCompileOptions};
use sample_parser::*;
use serde_json::json;

#[test]
fn test_json_required_integer() {
    check_schema(
        &json!({"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}),
        &[r#"{"a":1}"#, r#"{"a": 12}"#, "{\n  \"a\": -100\n}"],
        &["{}", r#"{"a":"1"}"#, r#"{"a":1,"a":1}"#, r#"{"b":1}"#, r#"{"a":1"#],
    );
}

#[test]
fn test_json_any() {
    check_schema(
        &json!(true),
        &[
            "null",
            "true",
            "-0.5",
            "1e10",
            r#"[1, {"x": null}, "hello world"]"#,
            r#"{"name": {"name": []}}"#,
            "{}",
        ],
        &["[1,]", r#"{"a"}"#, "tru", "01", r#"{"a":1,}"#],
    );
}

#[test]
fn test_json_layouts() {
    let schema = json!({
        "type": "object",
        "properties": {"name": {"type": "string"}, "tags": {"type": "array", "items": {"type": "string"}}},
        "required": ["name", "tags"]
    });
    check_schema_with(
        &schema,
        &JsonCompileOptions::indented(2),
        &[
            "{\n  \"name\": \"abc\",\n  \"tags\": [\n    \"x\",\n    \"y\"\n  ]\n}",
            "{\n  \"name\": \"\",\n  \"tags\": []\n}",
        ],
        &[
            r#"{"name": "abc", "tags": []}"#,
            "{\n    \"name\": \"abc\",\n    \"tags\": []\n}",
            "{\n  \"name\":\"abc\",\n  \"tags\": []\n}",
        ],
    );
    check_schema_with(
        &schema,
        &JsonCompileOptions::compact(",", ":"),
        &[r#"{"name":"abc","tags":["x"]}"#],
        &[r#"{"name": "abc","tags":["x"]}"#, "{\"name\":\"abc\",\n\"tags\":[]}"],
    );
    check_schema_with(
        &schema,
        &JsonCompileOptions::compact(", ", ": "),
        &[r#"{"name": "abc", "tags": ["x", "y"]}"#],
        &[r#"{"name":"abc","tags":[]}"#],
    );
}

#[test]
fn test_json_property_order() {
    let schema = json!({
        "type": "object",
        "properties": {"a": {"type": "integer"}, "b": {"type": "boolean"}, "c": {"type": "null"}},
        "required": ["a", "b"]
    });
    check_schema(
        &schema,
        &[r#"{"a":1,"b":true}"#, r#"{"a":1,"b":true,"c":null}"#],
        &[r#"{"b":true,"a":1}"#, r#"{"a":1,"c":null,"b":false}"#],
    );
    check_schema_with(
        &schema,
        &JsonCompileOptions {
            strict_properties_order: false,
            ..JsonCompileOptions::default()
        },
        &[r#"{"b":true,"a":1}"#, r#"{"c":null,"b":false,"a":12}"#],
        &[r#"{"b":true}"#, r#"{"a":1,"b":true,"b":true}"#],
    );
}

#[test]
fn test_json_additional_properties() {
    check_schema(
        &json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "additionalProperties": {"type": "string"}
        }),
        &[r#"{"a":1,"name":"abc"}"#, r#"{"x":"y"}"#, "{}"],
        &[r#"{"a":1,"name":1}"#],
    );
    check_schema(
        &json!({"type": "object", "properties": {"a": {"type": "integer"}}}),
        &[r#"{"a":1}"#, "{}"],
        &[r#"{"a":1,"b":2}"#],
    );
    check_schema_with(
        &json!({"type": "object", "properties": {"a": {"type": "integer"}}}),
        &JsonCompileOptions {
            allow_additional_properties: true,
            ..JsonCompileOptions::default()
        },
        &[r#"{"a":1,"b":[null]}"#],
        &[r#"{"a":"x"}"#],
    );
}

#[test]
fn test_json_strings() {
    check_schema(
        &json!({"type": "string"}),
        &[
            r#""hello world""#,
            r#""a\"b""#,
            r#""é\n""#,
            "\"é\"",
            r#""""#,
        ],
        &["\"a\nb\"", r#""\x""#, "hello", r#""abc"#],
    );
    check_schema(
        &json!({"type": "string", "pattern": "^[a-c]+[0-9]?$"}),
        &[r#""abc""#, r#""abca1""#, r#""a""#],
        &[r#""abcd""#, r#""abc12""#, r#""1""#],
    );
}

#[test]
fn test_json_numbers() {
    check_schema(
        &json!({"type": "integer", "minimum": -5, "maximum": 120}),
        &["-5", "0", "12", "120", "99"],
        &["-6", "121", "1.0"],
    );
    check_schema(
        &json!({"type": "number", "exclusiveMinimum": 0}),
        &["0.5", "12", "1.25"],
        &["0", "-1", "-0.5"],
    );
}

#[test]
fn test_json_enum_and_const() {
    check_schema(
        &json!({"enum": ["abc", 12, null, {"name": true}]}),
        &[r#""abc""#, "12", "null", r#"{"name":true}"#, r#"{ "name" : true }"#],
        &[r#""ab""#, "1", r#"{"name":false}"#],
    );
    check_schema(
        &json!({"type": "array", "items": {"const": "hello"}, "maxItems": 2}),
        &["[]", r#"["hello"]"#, r#"["hello", "hello"]"#],
        &[r#"["hello","hello","hello"]"#, r#"["hell"]"#],
    );
}

#[test]
fn test_json_refs() {
    check_schema(
        &json!({
            "$defs": {
                "tree": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "children": {"type": "array", "items": {"$ref": "#/$defs/tree"}}
                    },
                    "required": ["name"]
                }
            },
            "$ref": "#/$defs/tree"
        }),
        &[
            r#"{"name":"abc"}"#,
            r#"{"name":"abc","children":[{"name":"x","children":[]},{"name":"y"}]}"#,
        ],
        &[r#"{"name":"abc","children":[{}]}"#],
    );
}

#[test]
fn test_json_invalid_schemas() {
    let e = schema_error(&json!({"type": "banana"}));
    assert!(e.contains("JSON schema compilation failed"), "{}", e);
    assert!(e.contains("banana"), "{}", e);

    let e = compiler()
        .compile_json_schema("{\"type\":", &JsonCompileOptions::default())
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::SchemaCompile);

    assert!(schema_error(&json!({"properties": {"a": {"type": 7}}})).contains("Expected string"));
    assert!(schema_error(&json!({"$ref": "http://example.com/schema.json"})).contains("$ref"));
}

#[test]
fn test_json_validate_schema() {
    let schema = json!({"type": "string", "title": 5});
    let g = json_grammar(&schema, &JsonCompileOptions::default());
    check_grammar(&g, &[r#""abc""#], &["5"]);

    let options = JsonCompileOptions {
        validate_schema: true,
        ..JsonCompileOptions::default()
    };
    let e = compiler()
        .compile_json_schema_value(&schema, &options)
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::SchemaCompile);
    assert!(e.to_string().contains("Invalid JSON schema"), "{}", e);

    check_schema_with(
        &json!({"type": "string", "title": "fine"}),
        &options,
        &[r#""abc""#],
        &["1"],
    );
}

#[test]
fn test_json_max_whitespace() {
    let schema = json!({"type": "array", "items": {"type": "integer"}});
    let options = JsonCompileOptions {
        max_whitespace: Some(2),
        ..JsonCompileOptions::default()
    };
    check_schema_with(
        &schema,
        &options,
        &["[1,2]", "[1,  2]", "[ 1 , 2 ]", "[\n\t1]"],
        &["[1,   2]", "[    1]", "[1\n\n\n]"],
    );
    check_schema(&schema, &["[1,     2]"], &[]);
}
