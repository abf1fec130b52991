//! objsheet - run canned transactions and formulas against an object spreadsheet

mod config;
mod error;
mod render;

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use objsheet_core::{ColumnId, Sheet, Tablespace, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

fn print_usage() {
    eprintln!("Usage: objsheet [OPTIONS] <SHEET>");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <SHEET>                   Sheet definition file (.toml)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --call <NAME>         Execute a canned transaction (repeatable, runs in order)");
    eprintln!("  -a, --arg <NAME=JSON>     Argument for the preceding --call (JSON scalar or array)");
    eprintln!("  -e, --eval <FORMULA>      Evaluate a formula at the root and print the result");
    eprintln!("  -p, --print [COLUMN]      Print the tree projection (default: root)");
    eprintln!("      --compiler            Enable the formula compiler");
    eprintln!("      --config <FILE>       Read configuration from FILE");
    eprintln!("      --no-config           Ignore the user configuration file");
    eprintln!("  -h, --help                Print help");
}

#[derive(Debug, Default)]
struct Call {
    name: String,
    args: Vec<(String, String)>,
}

#[derive(Debug)]
enum Step {
    Call(Call),
    Eval(String),
    Print(Option<String>),
}

#[derive(Debug, Default)]
struct Options {
    sheet: Option<PathBuf>,
    steps: Vec<Step>,
    compiler: bool,
    config: Option<PathBuf>,
    no_config: bool,
    help: bool,
}

fn value_arg(args: &[String], i: usize, flag: &str, what: &str) -> error::Result<String> {
    args.get(i)
        .cloned()
        .ok_or_else(|| CliError::Usage(format!("{} requires {}", flag, what)))
}

fn parse_args(args: &[String]) -> error::Result<Options> {
    let mut options = Options::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                options.help = true;
                return Ok(options);
            }
            flag @ ("-c" | "--call") => {
                i += 1;
                let name = value_arg(args, i, flag, "a procedure name")?;
                options.steps.push(Step::Call(Call {
                    name,
                    args: Vec::new(),
                }));
            }
            flag @ ("-a" | "--arg") => {
                i += 1;
                let arg = value_arg(args, i, flag, "NAME=JSON")?;
                let Some(Step::Call(call)) = options.steps.last_mut() else {
                    return Err(CliError::Usage(format!("{} must follow --call", flag)));
                };
                let (name, json) = arg
                    .split_once('=')
                    .ok_or_else(|| CliError::Usage(format!("Expected NAME=JSON, got '{}'", arg)))?;
                call.args.push((name.to_string(), json.to_string()));
            }
            flag @ ("-e" | "--eval") => {
                i += 1;
                options.steps.push(Step::Eval(value_arg(args, i, flag, "a formula")?));
            }
            "-p" | "--print" => {
                // The column is optional; a following `.toml` path is the sheet.
                let column = args
                    .get(i + 1)
                    .filter(|next| !next.starts_with('-') && !next.ends_with(".toml"))
                    .cloned();
                if column.is_some() {
                    i += 1;
                }
                options.steps.push(Step::Print(column));
            }
            "--compiler" => options.compiler = true,
            flag @ "--config" => {
                i += 1;
                options.config = Some(PathBuf::from(value_arg(args, i, flag, "a file path")?));
            }
            "--no-config" => options.no_config = true,
            arg if arg.starts_with('-') => {
                return Err(CliError::Usage(format!("Unknown option: {}", arg)));
            }
            path => {
                if options.sheet.is_some() {
                    return Err(CliError::Usage(format!("Unexpected argument: {}", path)));
                }
                options.sheet = Some(PathBuf::from(path));
            }
        }
        i += 1;
    }
    if options.steps.is_empty() {
        options.steps.push(Step::Print(None));
    }
    Ok(options)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_call(tablespace: &Tablespace, call: Call) -> anyhow::Result<()> {
    let Call { name, args } = call;
    let label = name.clone();
    tablespace
        .run(move |sheet| {
            let mut values: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for (param, json) in &args {
                let json: serde_json::Value = serde_json::from_str(json).map_err(|e| {
                    objsheet_core::SheetError::BadArgument(format!("{}: {}", param, e))
                })?;
                let parsed = sheet.argument_from_json(&name, param, &json)?;
                values.insert(param.clone(), parsed);
            }
            sheet.execute_canned_transaction(&name, values)
        })
        .with_context(|| format!("transaction '{}'", label))
}

fn run(options: Options) -> anyhow::Result<()> {
    let config = if options.no_config {
        config::Config::default()
    } else {
        config::load(options.config.as_deref())?
    };
    init_logging(config.log_level());

    let path = options
        .sheet
        .ok_or_else(|| CliError::Usage("missing <SHEET>".to_string()))?;
    let mut sheet =
        Sheet::load_definition(&path).with_context(|| format!("loading {}", path.display()))?;
    let mut settings = config.engine;
    settings.compiler |= options.compiler;
    sheet.set_settings(settings);
    debug!(?settings, "loaded {}", path.display());

    let tablespace = Tablespace::new(path.display().to_string(), sheet)?;
    for step in options.steps {
        match step {
            Step::Call(call) => {
                info!(procedure = %call.name, "calling");
                run_call(&tablespace, call)?;
            }
            Step::Eval(formula) => {
                let label = formula.clone();
                let text = tablespace
                    .run(move |sheet| sheet.evaluate_formula_text(&formula).map(|(_, text)| text))
                    .with_context(|| format!("evaluating '{}'", label))?;
                println!("{}", text);
            }
            Step::Print(column) => {
                let text = tablespace.run(move |sheet| {
                    let id = match &column {
                        Some(reference) => sheet.schema().parse_column_ref(reference)?.column,
                        None => ColumnId::root(),
                    };
                    Ok(render::render(&sheet.project(&id)?))
                })?;
                print!("{}", text);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    if options.help {
        print_usage();
        return ExitCode::SUCCESS;
    }
    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("objsheet")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_calls_collect_their_args() {
        let options = parse_args(&args(&["s.toml", "-c", "p", "-a", "x=1", "-a", "y=[\"a\"]", "-e", "x"])).unwrap();
        assert_eq!(options.sheet, Some(PathBuf::from("s.toml")));
        let Step::Call(call) = &options.steps[0] else {
            panic!("expected a call");
        };
        assert_eq!(call.name, "p");
        assert_eq!(call.args, vec![("x".into(), "1".into()), ("y".into(), "[\"a\"]".into())]);
        assert!(matches!(&options.steps[1], Step::Eval(f) if f == "x"));
    }

    #[test]
    fn test_print_column_is_optional() {
        let options = parse_args(&args(&["-p", "s.toml"])).unwrap();
        assert!(matches!(options.steps[0], Step::Print(None)));
        assert_eq!(options.sheet, Some(PathBuf::from("s.toml")));

        let options = parse_args(&args(&["s.toml", "-p", "Person"])).unwrap();
        assert!(matches!(&options.steps[0], Step::Print(Some(c)) if c == "Person"));
    }

    #[test]
    fn test_usage_errors() {
        assert!(matches!(parse_args(&args(&["-a", "x=1"])), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(&args(&["-c"])), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(&args(&["--bogus"])), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(&args(&["a.toml", "b.toml"])), Err(CliError::Usage(_))));
    }

    #[test]
    fn test_default_step_prints_root() {
        let options = parse_args(&args(&["s.toml"])).unwrap();
        assert!(matches!(options.steps[..], [Step::Print(None)]));
    }
}
