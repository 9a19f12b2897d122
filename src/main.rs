mod config;
mod control;
mod device;
mod fan;
mod holiday;
mod peak;
mod schedule;
mod telemetry;
mod web;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::control::ControlLoop;
use crate::holiday::{HolidayCalendar, UsHolidays};
use crate::telemetry::PowerMonitor;
use crate::web::{create_web_server, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = PathBuf::from(
        std::env::var("SCHEDULE").unwrap_or_else(|_| "/config/schedule.yaml".to_string()),
    );
    let (devices, settings) = config::load(&path)
        .with_context(|| format!("failed to load schedule from {}", path.display()))?;
    let settings = Arc::new(settings);

    let calendar: Arc<dyn HolidayCalendar> = Arc::new(UsHolidays);
    let monitor = match &settings.influxdb {
        Some(influx) => Some(Arc::new(PowerMonitor::new(
            influx.clone(),
            settings.interval / 2,
            settings.http_timeout(),
        )?)),
        None => None,
    };

    let urls: Vec<String> = devices.iter().map(|device| device.url.clone()).collect();
    let snapshots = Arc::new(RwLock::new(ServerState::with_devices(&urls)));
    tokio::spawn(create_web_server(snapshots.clone(), settings.status_listen));

    info!(
        devices = devices.len(),
        interval = settings.interval,
        "starting thermostat scheduler"
    );

    let mut tasks = Vec::with_capacity(devices.len());
    for (slot, device) in devices.into_iter().enumerate() {
        let control = ControlLoop::new(
            device,
            settings.clone(),
            calendar.clone(),
            monitor.clone(),
            snapshots.clone(),
            slot,
        )?;
        tasks.push(tokio::spawn(control.run()));
    }
    futures::future::join_all(tasks).await;
    Ok(())
}
