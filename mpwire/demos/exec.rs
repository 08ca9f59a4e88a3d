//! Run code on a board and stream its output.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example exec -- --target /dev/ttyACM0 --code "import sys; print(sys.platform)"
//! cargo run --example exec -- --target socket://localhost:2217 --file main.py
//! cargo run --example exec -- --target "exec:./micropython" --code "print(1+1)" --soft-reset
//! ```

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use mpwire::{Repl, SessionBuilder, Target};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let target: Target = args.target.parse()?;

    let code = match (&args.code, &args.file) {
        (Some(code), _) => code.clone().into_bytes(),
        (None, Some(path)) => std::fs::read(path)?,
        (None, None) => b"import sys\nprint(sys.implementation)".to_vec(),
    };

    println!("Connecting to {}...", target);
    let mut session = SessionBuilder::new(target)
        .timeout(Duration::from_secs(args.timeout))
        .connect()
        .await?;

    session.enter(args.soft_reset).await?;
    println!(
        "Raw REPL ready (chunk size hint {})\n",
        session.chunk_size_hint().await?
    );

    session.submit_no_follow(&code).await?;
    let mut stream = session.follow_stream()?;
    let mut total_bytes = 0usize;
    while let Some(chunk) = stream.next_chunk().await? {
        total_bytes += chunk.len();
        print!("{}", String::from_utf8_lossy(&chunk));
        io::stdout().flush()?;
    }
    let response = stream.into_response().await?;

    println!("{}", "-".repeat(50));
    println!("{} bytes of stdout in {:?}", total_bytes, response.elapsed);
    if let Some(error) = response.error() {
        println!("Device error: {}", error);
    }

    session.exit().await?;
    session.close().await?;
    Ok(())
}

struct Args {
    target: String,
    code: Option<String>,
    file: Option<PathBuf>,
    soft_reset: bool,
    timeout: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut target = "/dev/ttyACM0".to_string();
        let mut code = None;
        let mut file = None;
        let mut soft_reset = false;
        let mut timeout = 10u64;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--target" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        target = args[i].clone();
                    }
                }
                "--code" | "-c" => {
                    i += 1;
                    if i < args.len() {
                        code = Some(args[i].clone());
                    }
                }
                "--file" | "-f" => {
                    i += 1;
                    if i < args.len() {
                        file = Some(PathBuf::from(&args[i]));
                    }
                }
                "--soft-reset" => soft_reset = true,
                "--timeout" => {
                    i += 1;
                    if i < args.len() {
                        timeout = args[i].parse().unwrap_or(10);
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
            code,
            file,
            soft_reset,
            timeout,
        }
    }

    fn print_help() {
        println!(
            r#"mpwire exec example

Runs code in the raw REPL and streams stdout as it arrives.

USAGE:
    cargo run --example exec -- [OPTIONS]

OPTIONS:
    -t, --target <TARGET>    Serial device, socket://host:port or exec:program [default: /dev/ttyACM0]
    -c, --code <CODE>        Code to run
    -f, --file <PATH>        File to run
    --soft-reset             Soft reset before running
    --timeout <SECS>         Inter-byte timeout [default: 10]
    -h, --help               Print this help message
"#
        );
    }
}
