use std::{env, fs, process::ExitCode, time::Instant};

use millrace::{CallResult, Environment, MemoryLoader, Output, RenderOptions, RenderProgress, Value};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: millrace <template.njk | script.csc> [context.json]");
        return ExitCode::FAILURE;
    };
    let source = match fs::read_to_string(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error reading {file_path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let ctx = match args.get(2) {
        Some(ctx_path) => match read_context(ctx_path) {
            Ok(ctx) => ctx,
            Err(err) => {
                eprintln!("error reading context {ctx_path}: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => Vec::new(),
    };

    let mut env = Environment::new();
    env.set_loader(MemoryLoader::new());

    let is_script = file_path.ends_with(".csc") || file_path.ends_with(".script");
    let template = match if is_script {
        env.compile_script(&source, Some(file_path))
    } else {
        env.compile_template(&source, Some(file_path))
    } {
        Ok(template) => template,
        Err(err) => {
            eprintln!("error:\n{err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let mut progress = match template.start(ctx, RenderOptions::default()) {
        Ok(progress) => progress,
        Err(err) => {
            eprintln!("error after {:?}:\n{err}", start.elapsed());
            return ExitCode::FAILURE;
        }
    };

    // Answer external calls in a loop. The demo host only implements
    // `env(NAME)`; everything else is rejected.
    loop {
        match progress {
            RenderProgress::Complete(output) => {
                eprintln!("rendered in {:?}", start.elapsed());
                print_output(&output);
                return ExitCode::SUCCESS;
            }
            RenderProgress::FunctionCall { call_id, path, args, state } => {
                let result = if path.len() == 1 && path[0] == "env" {
                    let name = args.first().map(Value::coerce_str).unwrap_or_default();
                    match env::var(&name) {
                        Ok(value) => CallResult::Return(Value::from(value)),
                        Err(_) => CallResult::Return(Value::Undefined),
                    }
                } else {
                    CallResult::Raise(format!("no host function `{}`", path.join(".")))
                };
                progress = match state.resume_call(call_id, result) {
                    Ok(progress) => progress,
                    Err(err) => {
                        eprintln!("error after {:?}:\n{err}", start.elapsed());
                        return ExitCode::FAILURE;
                    }
                };
            }
            RenderProgress::LoadTemplate { call_id, name, state } => {
                let found = fs::read_to_string(&name)
                    .ok()
                    .map(|body| millrace::TemplateSource::new(body, name.clone()));
                progress = match state.resume_load(call_id, found) {
                    Ok(progress) => progress,
                    Err(err) => {
                        eprintln!("error after {:?}:\n{err}", start.elapsed());
                        return ExitCode::FAILURE;
                    }
                };
            }
            RenderProgress::ResolveFutures(_) => {
                eprintln!("internal error: calls left unresolved by the driver loop");
                return ExitCode::FAILURE;
            }
        }
    }
}

fn read_context(path: &str) -> Result<Vec<(String, Value)>, String> {
    let body = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| e.to_string())?;
    let serde_json::Value::Object(map) = json else {
        return Err("context must be a JSON object".to_owned());
    };
    Ok(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
}

fn print_output(output: &Output) {
    match output {
        Output::Text(text) => println!("{text}"),
        other => match serde_json::to_string_pretty(&other.to_json()) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("error serializing output: {err}"),
        },
    }
}
