use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nac_export::{ExportOptions, ExportPipeline};

/// Package a trained neural audio codec into a deployable artifact.
#[derive(Debug, Parser)]
#[command(name = "nac-export", version, about)]
struct Cli {
    /// Run name under the runs directory; also names the artifact.
    #[arg(long)]
    name: String,
    /// Directory holding the run directories.
    #[arg(long, default_value = "runs")]
    runs: PathBuf,
    /// Directory the artifact is written into.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Export causal convolutions with streaming caches.
    #[arg(long)]
    streaming: bool,
    /// Cumulative explained-variance target for latent truncation.
    #[arg(long, default_value_t = 0.95)]
    fidelity: f32,
    /// Decode to two channels.
    #[arg(long)]
    stereo: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let options = ExportOptions {
        name: cli.name,
        runs_root: cli.runs,
        out_dir: cli.out,
        streaming: cli.streaming,
        fidelity: cli.fidelity,
        stereo: cli.stereo,
    };

    let report = ExportPipeline::new(options).run()?;
    info!(
        artifact = %report.artifact.display(),
        mode = %report.mode,
        latent_size = report.latent_size,
        ratio = report.ratio,
        channels = report.channels,
        "export complete"
    );
    if report.checkpoint.is_none() {
        info!("exported weights were randomly initialized; do not ship this artifact");
    }
    Ok(())
}
