//! `warren` – run one Thing from a TOML config file.
//!
//! Loads the config (defaults apply when the file is absent), initialises
//! tracing, builds the [`Thing`], and runs it until Ctrl-C. Construction
//! failures (bad port range, unparsable config) exit non-zero before
//! anything starts.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use warren_thing::{Thing, config, telemetry};

#[derive(Parser, Debug)]
#[command(name = "warren", version, about = "Run a warren Thing from a config file")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, short, default_value = "warren.toml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Tracing comes up before the Tokio runtime; the OTLP exporter is the
    // simple (synchronous) one for exactly this reason.
    let _guard = telemetry::init_tracing("warren");

    let cfg = match config::load(&args.config) {
        Ok(Some(cfg)) => {
            info!(path = %args.config.display(), "config loaded");
            cfg
        }
        Ok(None) => {
            info!(path = %args.config.display(), "no config file; using defaults");
            config::Config::default()
        }
        Err(e) => {
            error!(error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime build failed");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let thing = match Thing::new(cfg) {
            Ok(thing) => thing,
            Err(e) => {
                error!(error = %e, "thing construction failed");
                return ExitCode::FAILURE;
            }
        };

        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("ctrl-c received; shutting down");
                    shutdown.cancel();
                }
            });
        }

        match thing.run(shutdown).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "thing exited with error");
                ExitCode::FAILURE
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_defaults_to_warren_toml() {
        let args = Args::try_parse_from(["warren"]).unwrap();
        assert_eq!(args.config, PathBuf::from("warren.toml"));
    }

    #[test]
    fn config_path_override() {
        let args = Args::try_parse_from(["warren", "--config", "/etc/warren/hub.toml"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/warren/hub.toml"));

        let args = Args::try_parse_from(["warren", "-c", "hub.toml"]).unwrap();
        assert_eq!(args.config, PathBuf::from("hub.toml"));
    }
}
