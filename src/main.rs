//! Camstage demo: streams a simulated camera pipeline and takes a picture

use std::path::PathBuf;
use std::time::Duration;

use camstage::hw::HardwareSet;
use camstage::{utils, Command, HostEvent, Notification, Session};
use color_eyre::Result;
use tracing::{info, trace, warn};

fn init_tracing() {
    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("camstage=debug"))
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter("camstage=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Camstage launching...");

    // Usage: camstage [config.toml] [seconds]
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let run_for = args
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    let config = utils::load_config(config_path.as_deref())?;
    let hardware = HardwareSet::simulated(&config);
    let (tx, rx) = flume::bounded::<HostEvent>(config.display.event_queue);

    let mut session = Session::open(config, hardware)?;
    session.set_output_target(tx);

    // Host side: count what arrives until the session drops the channel
    let host = tokio::spawn(async move {
        let mut received = 0u64;
        while let Ok(event) = rx.recv_async().await {
            match event {
                HostEvent::Notify(Notification::Error { stage, reason }) => {
                    warn!(?stage, %reason, "Pipeline fault reported");
                }
                HostEvent::Notify(notification) => info!(?notification, "Notification"),
                HostEvent::Data {
                    kind,
                    frame_count,
                    payload,
                } => {
                    received += 1;
                    trace!(?kind, frame_count, bytes = payload.len(), "Data");
                }
                HostEvent::DataWithTimestamp {
                    frame_count,
                    timestamp_ns,
                    ..
                } => trace!(frame_count, timestamp_ns, "Recording frame"),
            }
        }
        received
    });

    session.start_preview()?;
    session.send_command(Command::FaceDetection(true))?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Err(e) = session.take_picture(1) {
        warn!(error = %e, "Still capture unavailable");
    }

    // Nobody hands recording frames back here, so at most
    // `recording.max_in_flight` of them go out
    session.start_recording()?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    session.stop_recording();

    match run_for {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            info!("Streaming, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    session.stop_preview()?;
    info!(stats = ?session.stats(), "Session stats");
    session.close()?;

    let received = host.await?;
    info!(received, "Camstage shutting down");
    Ok(())
}
