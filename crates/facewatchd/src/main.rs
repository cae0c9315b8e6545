use std::sync::Arc;

use anyhow::{Context, Result};
use facewatch_core::{IdentityStore, SystemClock};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod monitor;
mod notify;
mod placeholder;
mod reaper;
mod recognition;
mod resolver;

use config::Config;
use dbus_interface::{FacewatchService, BUS_NAME, OBJECT_PATH};
use engine::Engine;
use recognition::HttpRecognizer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load().context("failed to load configuration")?;
    let clock = Arc::new(SystemClock);
    let store = Arc::new(
        IdentityStore::open(&config.db_path, clock.clone())
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );
    let recognizer = Arc::new(
        HttpRecognizer::new(config.recognition_url.clone(), config.recognition_timeout())
            .context("failed to build recognition client")?,
    );

    let (engine, notifications) = Engine::init(&config, store, recognizer, clock)?;
    let (feed, detection) = monitor::spawn(
        engine.clone(),
        config.tick_interval(),
        config.face_queue_depth,
    )
    .context("failed to spawn detection thread")?;

    let display = config.notification_display();
    let consumer_engine = engine.clone();
    let consumer = tokio::spawn(notify::display_notifications(
        notifications,
        display,
        move |note| {
            consumer_engine.dismiss(&note.label);
        },
    ));

    let service = FacewatchService {
        engine: engine.clone(),
        feed,
    };
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facewatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewatchd shutting down");

    tokio::task::spawn_blocking(move || detection.stop()).await?;
    engine.shutdown().await;
    consumer.abort();

    Ok(())
}
