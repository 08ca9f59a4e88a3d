//! Interactive terminal on a board's REPL.
//!
//! The local terminal is put in raw mode so every keystroke (Ctrl-C, Ctrl-D,
//! arrows) goes straight to the device. Ctrl-] or Ctrl-X leaves.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example repl -- --target /dev/ttyACM0
//! cargo run --example repl -- --target socket://localhost:2217 --inject-file main.py
//! ```

use std::env;
use std::path::PathBuf;

use crossterm::terminal;
use mpwire::{ReplBuilder, ReplOutcome, Session, SessionConfig, Target};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let target: Target = args.target.parse()?;

    let mut builder = ReplBuilder::new().escape_non_printable(args.escape);
    if let Some(code) = &args.inject_code {
        builder = builder.inject_code(code);
    }
    if let Some(path) = &args.inject_file {
        builder = builder.inject_file(path);
    }
    if let Some(path) = &args.capture {
        builder = builder.capture(path);
    }

    let session = Session::connect(&target, SessionConfig::default()).await?;
    for line in builder.intro(&target.describe()) {
        println!("{}", line);
    }

    terminal::enable_raw_mode()?;
    let outcome = builder
        .run(session.into_shared(), tokio::io::stdin(), tokio::io::stdout())
        .await;
    terminal::disable_raw_mode()?;

    match outcome {
        ReplOutcome::Detached => println!(),
        ReplOutcome::Disconnected => eprintln!("\ndevice disconnected"),
        ReplOutcome::Failed(message) => {
            eprintln!("\n{}", message);
            std::process::exit(1);
        }
    }
    Ok(())
}

struct Args {
    target: String,
    escape: bool,
    inject_code: Option<String>,
    inject_file: Option<PathBuf>,
    capture: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut target = "/dev/ttyACM0".to_string();
        let mut escape = false;
        let mut inject_code = None;
        let mut inject_file = None;
        let mut capture = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--target" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        target = args[i].clone();
                    }
                }
                "--escape-non-printable" => escape = true,
                "--inject-code" => {
                    i += 1;
                    if i < args.len() {
                        inject_code = Some(args[i].clone());
                    }
                }
                "--inject-file" => {
                    i += 1;
                    if i < args.len() {
                        inject_file = Some(PathBuf::from(&args[i]));
                    }
                }
                "--capture" => {
                    i += 1;
                    if i < args.len() {
                        capture = Some(PathBuf::from(&args[i]));
                    }
                }
                "--help" | "-h" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    Self::print_help();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Self {
            target,
            escape,
            inject_code,
            inject_file,
            capture,
        }
    }

    fn print_help() {
        println!(
            r#"mpwire repl example

Pass-through terminal on the device's friendly REPL.

USAGE:
    cargo run --example repl -- [OPTIONS]

OPTIONS:
    -t, --target <TARGET>       Serial device, socket://host:port or exec:program [default: /dev/ttyACM0]
    --escape-non-printable      Show non-printable device bytes as hex
    --inject-code <CODE>        Code sent on Ctrl-J (\n for newlines)
    --inject-file <PATH>        File run in raw mode on Ctrl-K
    --capture <PATH>            Copy the session to a file
    -h, --help                  Print this help message
"#
        );
    }
}
