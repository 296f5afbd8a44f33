use std::{env, fs::File, io::Read, time::Instant};

use grammask::{GrammarCompiler, GrammarMatcher, JsonCompileOptions};
use serde_json::Value;

fn test_file(compiler: &GrammarCompiler, file: &str) {
    let schema_file = read_file_to_string(file);
    let opts = JsonCompileOptions::default();
    let val: Value = match serde_json::from_str(&schema_file) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{} Invalid JSON: {}", file, e);
            return;
        }
    };

    let t0 = Instant::now();
    let grammar = match compiler.compile_json_schema_value(&val, &opts) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{} Error: {}", file, e);
            return;
        }
    };
    let compile_time = t0.elapsed();

    let mut matcher = GrammarMatcher::new(&grammar).expect("matcher construction failed");
    let t1 = Instant::now();
    let mask = matcher.compute_mask().expect("mask computation failed");
    eprintln!(
        "{} OK: {:?}; compile {:?}, first mask {:?} ({} tokens allowed)",
        file,
        grammar,
        compile_time,
        t1.elapsed(),
        mask.num_set()
    );
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <tokenizer.json> <json-schema.json|folder>...",
            args[0]
        );
        std::process::exit(1);
    }

    let vocab = sample_parser::vocab_from_file(&args[1]).expect("Unable to load tokenizer");
    let mut compiler = GrammarCompiler::new(&vocab);
    compiler.set_stderr_log_level(1).set_cache_enabled(false);

    let mut files = vec![];
    for arg in &args[2..] {
        if arg.ends_with(".json") {
            files.push(arg.to_string());
        } else {
            let dir = std::fs::read_dir(arg).expect("Unable to read directory");
            for entry in dir {
                let entry = entry.expect("Unable to read entry");
                let path = entry.path();
                if path.is_file() && path.to_str().unwrap().ends_with(".json") {
                    files.push(path.to_str().unwrap().to_string());
                }
            }
        }
    }
    files.sort();

    for file in files {
        test_file(&compiler, &file);
    }
}

fn read_file_to_string(filename: &str) -> String {
    let mut file = File::open(filename).expect("Unable to open file");
    let mut content = String::new();
    file.read_to_string(&mut content)
        .expect("Unable to read file");
    content
}
