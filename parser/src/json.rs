//! JSON Schema to grammar compilation.

use anyhow::Result;
use serde_json::Value;

use crate::{earley::Grammar, GrammarBuilder, NodeRef};

mod compiler;
mod formats;
mod merge;
mod numeric;

pub use compiler::JsonCompileOptions;
pub use formats::lookup_format;
pub use numeric::{rx_float_range, rx_int_range};

/// Grammar node for JSON text matching `schema`, added to `builder`.
/// `$ref`s are resolved against `schema`. Returns the node and any
/// warnings (unknown formats and the like).
pub fn json_schema_node(
    builder: &mut GrammarBuilder,
    schema: &Value,
    options: &JsonCompileOptions,
) -> Result<(NodeRef, Vec<String>)> {
    let mut compiler = compiler::Compiler::new(builder, options);
    let node = compiler.execute(schema)?;
    Ok((node, compiler.warnings))
}

pub fn json_schema_to_grammar(
    schema: &Value,
    options: &JsonCompileOptions,
    max_size: usize,
) -> Result<(Grammar, Vec<String>)> {
    let mut builder = GrammarBuilder::new(max_size);
    let (root, warnings) = json_schema_node(&mut builder, schema, options)?;
    builder.set_start_node(root);
    Ok((builder.finalize()?, warnings))
}
