//! mpbridge: expose a MicroPython executable as an RFC 2217 server.
//!
//! ```bash
//! mpbridge ./ports/unix/build-standard/micropython
//! mpbridge -p 2217 -v ./micropython
//! ```
//!
//! Then connect with `mpremote connect rfc2217://localhost:2217` or
//! `pyserial-miniterm rfc2217://localhost:2217 115200`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{LevelFilter, error, info};

use mpwire::{Bridge, BridgeConfig};

/// MicroPython RFC 2217 bridge
#[derive(Parser, Debug)]
#[command(
    name = "mpbridge",
    version,
    about = "Expose a MicroPython REPL via RFC 2217",
    after_help = "NOTE: No security measures are implemented. Anyone can remotely connect \
to this service over the network.\n\nOnly one connection at once is supported. When the \
connection is terminated, it waits for the next connect. The MicroPython process is \
started on the first connection and kept running between connections."
)]
struct Cli {
    /// Path to the MicroPython executable
    #[arg(value_name = "MICROPYTHON_PATH")]
    micropython_path: PathBuf,

    /// Local TCP port
    #[arg(short, long, default_value_t = 2217)]
    port: u16,

    /// Local host/interface to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Increase verbosity (can be given multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Additional arguments to pass to MicroPython (e.g. "-i script.py")
    #[arg(long, value_name = "ARGS", default_value = "", allow_hyphen_values = true)]
    micropython_args: String,

    /// Working directory for the MicroPython process
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,
}

fn level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn check_executable(path: &Path) -> Result<(), String> {
    let meta = std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .ok_or_else(|| format!("MicroPython executable not found: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(format!(
                "MicroPython executable is not executable: {}",
                path.display()
            ));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Lifecycle messages are always shown; -v raises the protocol detail.
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("mpwire", level(cli.verbose).max(LevelFilter::Info))
        .filter_module("mpwire::bridge::rfc2217", level(cli.verbose))
        .parse_default_env()
        .init();

    if let Err(message) = check_executable(&cli.micropython_path) {
        eprintln!("Error: {message}");
        return ExitCode::FAILURE;
    }

    let mut config = BridgeConfig::new(&cli.micropython_path).args_from_str(&cli.micropython_args);
    if let Some(cwd) = &cli.cwd {
        config = config.cwd(cwd);
    }

    info!("MicroPython RFC 2217 Bridge - type Ctrl-C to quit");
    info!("MicroPython executable: {}", cli.micropython_path.display());

    let listener = match mpwire::bridge::bind(&cli.host, cli.port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut bridge = Bridge::new(config);
    tokio::select! {
        result = bridge.serve(listener) => {
            if let Err(e) = result {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    bridge.shutdown();
    info!("--- exit ---");
    ExitCode::SUCCESS
}
