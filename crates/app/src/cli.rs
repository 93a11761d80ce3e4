//! Command-line interface for the service binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "streamscrub",
    version,
    about = "Multi-stream face redaction service with MJPEG delivery"
)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(default_value = "configs/dual.yaml")]
    pub config: PathBuf,

    /// Tracing filter directives (overrides RUST_LOG), e.g. "debug" or
    /// "streamscrub=debug,actix_web=warn".
    #[arg(long)]
    pub log_filter: Option<String>,
}
