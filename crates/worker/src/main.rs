//! `imagegen-worker` -- generate images for one prompt from the command line.
//!
//! Submits the prompt to the configured compute server, waits for the
//! job to finish, and saves every produced image into the output
//! directory. Prints one saved path per line on success; exits with
//! status 1 on any failure.
//!
//! Server settings come from the environment (see
//! [`GenerationConfig::from_env`]); a `.env` file is loaded first when
//! present.

use std::path::PathBuf;

use clap::Parser;
use imagegen_core::storage::DirectorySink;
use imagegen_pipeline::{generate, GenerationConfig, GenerationEvent};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "imagegen-worker")]
#[command(about = "Generate images for a text prompt on a ComfyUI-compatible server")]
#[command(long_about = None)]
struct Args {
    /// Text prompt to render.
    #[arg(short, long)]
    prompt: String,

    /// Directory to save images into. Overrides `COMFYUI_OUTPUT_DIR`.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "imagegen_worker=info,imagegen_pipeline=info,imagegen_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.prompt.trim().is_empty() {
        tracing::error!("Prompt cannot be empty.");
        std::process::exit(1);
    }

    let mut config = GenerationConfig::from_env();
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    tracing::info!(
        server = %config.server_url,
        output_dir = %config.output_dir.display(),
        "Starting imagegen-worker",
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Progress(ratio) => {
                    tracing::info!(percent = (ratio * 100.0).round(), "Progress");
                }
                GenerationEvent::Preview(url) => {
                    tracing::info!(bytes = url.len(), "Preview received");
                }
            }
        }
    });

    let sink = DirectorySink::new(config.output_dir.clone());
    let result = generate(&args.prompt, &config, &sink, Some(tx)).await;
    let _ = reporter.await;

    match result {
        Ok(output) => {
            if output.failed_downloads > 0 {
                tracing::warn!(
                    failed = output.failed_downloads,
                    "Some images could not be downloaded",
                );
            }
            for path in output.paths() {
                println!("{}", path.display());
            }
        }
        Err(e) => {
            if e.is_retryable() {
                tracing::error!(error = %e, "Generation failed; try again");
            } else {
                tracing::error!(error = %e, "Generation failed");
            }
            std::process::exit(1);
        }
    }
}
