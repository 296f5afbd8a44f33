use std::{env, fs::File, io::Read};

use grammask::{GrammarCompiler, GrammarMatcher, JsonCompileOptions, MatcherState};
use serde_json::Value;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        eprintln!(
            "Usage: {} <tokenizer.json> <schema.json|structural_tag.json> <sample.txt>",
            args[0]
        );
        std::process::exit(1);
    }

    let vocab = sample_parser::vocab_from_file(&args[1]).expect("Unable to load tokenizer");

    // set to 2 for more output
    let stderr_log_level = 1;
    let mut compiler = GrammarCompiler::new(&vocab);
    compiler
        .set_stderr_log_level(stderr_log_level)
        .set_buffer_log_level(2);

    let source = read_file_to_string(&args[2]);
    let source_json: Value = serde_json::from_str(&source).expect("Invalid JSON in grammar");
    let grammar = if source_json["type"] == "structural_tag" {
        compiler.compile_structural_tag(&source)
    } else {
        compiler.compile_json_schema_value(&source_json, &JsonCompileOptions::default())
    }
    .expect("Compilation failed");
    send_output(grammar.compile_logs());

    let sample = read_file_to_string(&args[3]);
    let mut tokens = vocab
        .greedy_tokenize(sample.as_bytes())
        .expect("Cannot tokenize sample");
    tokens.extend(vocab.stop_tokens().first());

    eprintln!("Parsing tokens: {}", vocab.tokens_dbg(&tokens));

    let mut matcher = GrammarMatcher::new(&grammar).expect("Cannot create matcher");
    for (idx, &token) in tokens.iter().enumerate() {
        let mask = matcher.compute_mask().expect("Mask computation failed");
        let forced = matcher.compute_forced_bytes();
        println!(
            "SAMPLE {}: {} {}; {} tokens allowed{}",
            idx,
            token,
            vocab.token_dbg(token),
            mask.num_set(),
            if forced.is_empty() {
                String::new()
            } else {
                format!("; forced {:?}", String::from_utf8_lossy(&forced))
            }
        );

        if let Err(e) = matcher.accept_token(token) {
            println!("Error: {}", e);
            break;
        }

        // send output to the user
        send_output(&matcher.flush_logs());
    }

    send_output(&matcher.flush_logs());
    println!("Final state: {:?}", matcher.state());
    println!("Stats: {:?}", matcher.stats());
    if matcher.state() != MatcherState::Complete {
        std::process::exit(1);
    }
}

fn read_file_to_string(filename: &str) -> String {
    let mut file = File::open(filename).expect("Unable to open file");
    let mut content = String::new();
    file.read_to_string(&mut content)
        .expect("Unable to read file");
    content
}

fn send_output(user_output: &str) {
    // enable if you want to see the output
    if false {
        println!("{}", user_output);
    }
}
