use std::{env, fs, process::ExitCode, time::Instant};

use quill::{Interpreter, Value};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: quill <script.ql>");
        return ExitCode::FAILURE;
    };
    let source = match read_file(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut interpreter = Interpreter::new();
    if let Err(err) = interpreter.init(vec![], vec![], vec![]) {
        eprintln!("error:\n{err}");
        return ExitCode::FAILURE;
    }

    let start = Instant::now();
    match interpreter.eval(&source) {
        Ok(value) => {
            let elapsed = start.elapsed();
            if !matches!(value, Value::Null) {
                println!("{}", interpreter.display(&value));
            }
            eprintln!("finished in {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            let elapsed = start.elapsed();
            eprintln!("error after {elapsed:?}:\n{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("cannot read `{path}`: {err}"))
}
