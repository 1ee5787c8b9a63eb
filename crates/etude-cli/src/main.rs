//! Server entry point.
//!
//! Exit codes: 0 normal, 1 init failure, 2 bad arguments (clap).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use etude_core::error::{WebError, WebResult};
use etude_core::{WebConfig, WebHost, fiber};

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Embedded web engine for device runtimes")]
#[command(version)]
struct Cli {
    /// Run detached in the background
    #[arg(long)]
    background: bool,

    /// Configuration file (JSON, top-level or under a "web" key)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug mode: verbose logging and request timeouts disabled
    #[arg(long)]
    debug: bool,

    /// Exit when EVENT is signaled, or after SECS seconds
    #[arg(long, value_name = "EVENT|SECS")]
    exit: Option<String>,

    /// Change to DIR before loading the config
    #[arg(long, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Listen endpoint override (repeatable)
    #[arg(long, value_name = "ENDPOINT")]
    listen: Vec<String>,

    /// Select a config profile to overlay
    #[arg(long, value_name = "NAME")]
    profile: Option<String>,

    /// Log errors only
    #[arg(long)]
    quiet: bool,

    /// Trace flags: H/B received headers/body, h/b transmitted
    #[arg(long, value_name = "HBhb")]
    show: Option<String>,

    /// Disable request timeouts (debugging through breakpoints)
    #[arg(long)]
    timeouts: bool,

    /// Log filter specification (tracing EnvFilter syntax)
    #[arg(long, value_name = "SPEC")]
    trace: Option<String>,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.background {
        return match respawn_detached() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("etude: cannot background: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let level = if let Some(spec) = &cli.trace {
        spec.clone()
    } else if cli.debug {
        "debug".to_string()
    } else if cli.verbose {
        "etude_core=debug,info".to_string()
    } else if cli.quiet {
        "error".to_string()
    } else {
        "info".to_string()
    };
    etude_core::init_logging_with_level(&level);

    match serve(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("init failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Re-exec without `--background` and leave the child running.
fn respawn_detached() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|a| a != "--background")
        .collect();
    std::process::Command::new(exe).args(args).spawn()?;
    Ok(())
}

fn serve(cli: Cli) -> WebResult<()> {
    if let Some(home) = &cli.home {
        std::env::set_current_dir(home)
            .map_err(|e| WebError::BadArgs(format!("--home {}: {}", home.display(), e)))?;
    }

    let mut config = load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    if !cli.listen.is_empty() {
        config.listen = cli.listen.clone();
    }
    if let Some(show) = &cli.show {
        config.show = show.clone();
    }
    if cli.timeouts || cli.debug {
        config.timeouts.parse = 0;
        config.timeouts.inactivity = 0;
        config.timeouts.request = 0;
    }

    fiber::run(async move {
        let host = WebHost::new(config)?;
        host.listen().await?;

        if let Some(exit) = cli.exit.clone() {
            let trigger = host.clone();
            fiber::spawn(async move {
                match exit.parse::<u64>() {
                    Ok(secs) => fiber::sleep_ms(secs * 1000).await,
                    Err(_) => fiber::watch(&exit).await,
                }
                trigger.shutdown();
            });
        }

        let waiter = host.clone();
        fiber::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt: shutting down");
                waiter.shutdown();
            }
        });

        host.run().await;
        Ok(())
    })
}

/// Load the config file, overlaying the selected profile from its
/// `profiles` table when one is named.
fn load_config(path: Option<&std::path::Path>, profile: Option<&str>) -> WebResult<WebConfig> {
    let Some(path) = path else {
        let fallback = std::path::Path::new("etude.json");
        if fallback.exists() {
            return load_config(Some(fallback), profile);
        }
        return Ok(WebConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| WebError::NotFound(format!("{}: {}", path.display(), e)))?;
    let mut value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| WebError::BadArgs(format!("{}: {}", path.display(), e)))?;

    if let Some(name) = profile {
        let overlay = value
            .get("profiles")
            .and_then(|p| p.get(name))
            .cloned()
            .ok_or_else(|| WebError::BadArgs(format!("unknown profile: {}", name)))?;
        merge(&mut value, &overlay);
    }
    WebConfig::from_value(value)
}

/// Deep-merge `overlay` into `base`: objects recurse, everything else
/// replaces.
fn merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                merge(base_map.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}
