mod clock;
mod config;
mod db;
mod ledger;
mod notify;
mod plant;
mod profile;
mod schedule;
mod scheduler;
mod session;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use std::{env, path::Path, sync::Arc, time::Duration};
use time::UtcOffset;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use config::Config;
use db::Db;
use ledger::SqliteLedger;
use notify::NotificationSink;
use scheduler::ReminderScheduler;
use session::SessionManager;
use state::AppState;
use store::PlantData;
use web::AppContext;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // The local offset can only be read soundly while single-threaded.
    let local_offset = UtcOffset::current_local_offset().unwrap_or_else(|_| {
        warn!("could not determine local utc offset, using UTC");
        UtcOffset::UTC
    });

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(local_offset))
}

async fn run(local_offset: UtcOffset) -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:plantcare.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed plants) ────────────────────────────────────
    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };
    config::apply(&cfg, &db).await?;

    let offset = cfg.utc_offset()?.unwrap_or(local_offset);
    let tick = Duration::from_secs(cfg.scheduler.tick_sec);

    // ── Shared state + services ─────────────────────────────────────
    let shared = AppState::shared();
    shared.write().await.record_system("hub started".to_string());

    let clock = Arc::new(SystemClock::new(offset));
    info!(offset = %clock.offset(), tick_sec = cfg.scheduler.tick_sec, "scheduler configured");
    let sink = notify::build_sink(
        cfg.notifications.webhook_url.as_deref(),
        cfg.notifications.enabled,
    )?;
    if !sink.is_permitted() {
        info!("notifications disabled, reminders will only flag plants");
    }

    let plants = Arc::new(PlantData::new(
        shared.clone(),
        Arc::new(db.clone()),
        clock.clone(),
    ));
    let (session_tx, session_rx) = session::channel();
    let scheduler = Arc::new(ReminderScheduler::new(
        plants.clone(),
        sink,
        Arc::new(SqliteLedger::new(db.clone())),
        clock,
        session_rx,
        shared.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(
        session_tx,
        plants.clone(),
        scheduler,
        shared.clone(),
        tick,
    ));

    if let Some(user_id) = cfg.user_id.as_deref() {
        sessions
            .login(user_id)
            .await
            .with_context(|| format!("failed to log in configured user '{user_id}'"))?;
    }

    // ── Web server ──────────────────────────────────────────────────
    let ctx = AppContext {
        shared,
        plants,
        sessions: sessions.clone(),
        db,
    };
    let web = tokio::spawn(web::serve(ctx, web_port));

    tokio::select! {
        res = web => match res {
            Ok(Err(e)) => error!("web server stopped: {e:#}"),
            Err(e) => error!("web server task failed: {e}"),
            Ok(Ok(())) => {}
        },
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    sessions.logout().await;
    Ok(())
}
