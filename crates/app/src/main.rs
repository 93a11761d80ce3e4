mod cli;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, trace, warn};

use streamscrub::pipeline::{self, telemetry, PipelineRuntime, StreamHub};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = cli::Cli::parse();
    telemetry::init(args.log_filter.as_deref());
    let _ = telemetry::init_metrics_recorder();

    let config = pipeline::load_config(&args.config)?;
    let streams = pipeline::expand_replicas(config.streams);
    if streams.is_empty() {
        bail!("no streams configured");
    }

    let hub = Arc::new(StreamHub::default());
    for stream in &streams {
        hub.register_stream(&format!("{}/ui", stream.id));
        hub.register_stream(&format!("{}/inf", stream.id));
    }

    let server = pipeline::spawn_server(
        hub.clone(),
        config.server.host.clone(),
        config.server.port,
    )?;
    info!(
        "serving MJPEG on http://{}:{}/video/{{key}}",
        config.server.host, config.server.port
    );

    let mut runtime = PipelineRuntime::new(hub, streams, config.runtime);
    runtime.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    }

    while !shutdown.load(Ordering::SeqCst) {
        if let Some(out) = runtime.pop_tracker_output(Duration::from_millis(200)) {
            trace!(
                stream = %out.stream_id,
                frame = out.frame_id,
                tracks = out.tracks.len(),
                "tracker output"
            );
        }
    }

    info!("shutting down");
    runtime.stop();
    server.stop();
    Ok(())
}
