//! Artemis acquisition demo against the simulated camera

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use artemis::capture::SimulatedCamera;
use artemis::display::{DisplayFrame, StatusEvent};
use artemis::{utils, CameraSession};
use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How long fast mode runs before the single exposure
const FAST_MODE_RUN: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("artemis=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Artemis Launching...");

    // Load configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = utils::load_config(config_path.as_deref())?;
    artemis::CONFIG.store(Arc::new(config.clone()));

    // Set up render/status sinks
    let (render_tx, render_rx) = flume::bounded::<DisplayFrame>(config.pipeline.render_queue);
    let (status_tx, status_rx) = flume::unbounded::<StatusEvent>();

    let render_task = tokio::spawn(async move {
        let mut frames = 0u64;
        while let Ok(frame) = render_rx.recv_async().await {
            frames += 1;
            debug!(
                "Frame {} ready: {}x{}, {} bytes",
                frame.sequence,
                frame.width(),
                frame.height(),
                frame.data.len()
            );
        }
        frames
    });

    let status_task = tokio::spawn(async move {
        while let Ok(event) = status_rx.recv_async().await {
            match event {
                StatusEvent::Temperature(sample) => info!("Temperature: {:.2} C", sample.value()),
                StatusEvent::NoCooling => info!("Temperature: no cooling"),
                StatusEvent::Exposure(status) => info!("Exposure: {}", status),
                StatusEvent::Fps(fps) => info!("Fast mode: {:.2} fps", fps),
                StatusEvent::Fault(e) => warn!("Camera fault: {}", e),
            }
        }
    });

    let camera = Arc::new(SimulatedCamera::new(config.simulator.clone()));
    let mut session = CameraSession::connect(
        camera,
        config.clone(),
        Arc::new(render_tx),
        Arc::new(status_tx),
    )?;

    info!("Camera options: {:?}", session.options());

    if let Err(e) = session.start_cooling() {
        warn!("Cooling unavailable: {}", e);
    }

    if config.simulator.fast_mode {
        session.start_fast_mode()?;
        tokio::select! {
            _ = tokio::time::sleep(FAST_MODE_RUN) => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
        session.stop_fast_mode()?;
        info!("Pipeline: {:?}", session.metrics());
    }

    session.start_exposure()?;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if !session.exposure_in_progress() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping exposure");
                session.stop_exposure()?;
                break;
            }
        }
    }

    // Dropping the session releases the sinks, which ends both receiver tasks
    session.disconnect()?;
    let frames = render_task.await?;
    status_task.await?;

    info!("Artemis shutting down after {} frames", frames);
    Ok(())
}
