use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::{DeviceConfig, Settings};
use crate::device::{Command, DeviceClient, OperatingMode};
use crate::fan::FanDutyCycle;
use crate::holiday::HolidayCalendar;
use crate::peak::{peak_override, PowerReading};
use crate::schedule::{ActiveSetpoint, Mode, ScheduleCatalog, StateIdentity};
use crate::telemetry::PowerMonitor;
use crate::web::SharedState;

/// Confirmation attempts per command.
const CONFIRM_TRIES: u32 = 3;

/// Mutable per-device control state. Owned by that device's loop, never
/// shared.
#[derive(Debug, Default)]
struct DeviceControlState {
    last_applied: Option<StateIdentity>,
    fan: FanDutyCycle,
    last_on: Option<NaiveDateTime>,
}

/// Drives one thermostat: resolves the active setpoint each tick and
/// applies it when it differs from the last applied state.
pub struct ControlLoop {
    url: String,
    client: DeviceClient,
    catalog: ScheduleCatalog,
    settings: Arc<Settings>,
    calendar: Arc<dyn HolidayCalendar>,
    monitor: Option<Arc<PowerMonitor>>,
    state: DeviceControlState,
    snapshots: SharedState,
    slot: usize,
}

impl ControlLoop {
    pub fn new(
        device: DeviceConfig,
        settings: Arc<Settings>,
        calendar: Arc<dyn HolidayCalendar>,
        monitor: Option<Arc<PowerMonitor>>,
        snapshots: SharedState,
        slot: usize,
    ) -> Result<ControlLoop> {
        let client = DeviceClient::new(&device.url, settings.http_timeout())?;
        Ok(ControlLoop::with_client(
            device, client, settings, calendar, monitor, snapshots, slot,
        ))
    }

    fn with_client(
        device: DeviceConfig,
        client: DeviceClient,
        settings: Arc<Settings>,
        calendar: Arc<dyn HolidayCalendar>,
        monitor: Option<Arc<PowerMonitor>>,
        snapshots: SharedState,
        slot: usize,
    ) -> ControlLoop {
        ControlLoop {
            url: device.url,
            client,
            catalog: device.catalog,
            settings,
            calendar,
            monitor,
            state: DeviceControlState::default(),
            snapshots,
            slot,
        }
    }

    /// Run forever: an immediate first cycle, then one per interval. A
    /// tick that fires while a cycle is still in flight is skipped, never
    /// queued. A failed cycle is logged and retried on the next tick.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.cycle(Local::now().naive_local()).await {
                error!(device = %self.url, error = ?err, "control cycle failed");
            }
        }
    }

    async fn cycle(&mut self, now: NaiveDateTime) -> Result<()> {
        let status = self.client.status().await?;
        debug!(device = %self.url, ?status, "device status");

        let operating = status.operating_mode()?;
        let running = status.is_running();

        // Leave the device alone while it schedules itself or is off/auto.
        let mode = match operating.schedule_mode() {
            Some(mode) if !status.internal_schedule_active() => mode,
            _ => {
                self.publish(now, operating, running, None);
                return Ok(());
            }
        };

        if running {
            self.state.last_on = Some(now);
        }

        let Some(mut active) = self.catalog.resolve(
            self.calendar.as_ref(),
            &self.settings.holidays,
            now,
            mode,
        ) else {
            debug!(device = %self.url, "no schedule set");
            self.publish(now, operating, running, None);
            return Ok(());
        };

        if active.is_peak {
            if let Some(peak_value) = active.peak_value {
                let reading = self.power_reading().await;
                let production_thresh = self.settings.production_threshold(mode);
                let consumption_thresh = self.settings.consumption_threshold(mode);
                if peak_override(running, reading, production_thresh, consumption_thresh) {
                    info!(
                        device = %self.url,
                        running,
                        production = reading.production,
                        consumption = reading.consumption,
                        peak_value,
                        "solar output below threshold, changing to peak setpoint"
                    );
                    active.target = peak_value;
                }
            }
        }

        let (heattemp, cooltemp) = match mode {
            Mode::Heat => (active.target, status.cooltemp),
            Mode::Cool => (status.heattemp, active.target),
        };

        let last_fan = self.state.fan.forced();
        self.state.fan.tick(now, running, self.settings.interval);
        let fan = self.state.fan.desired(now, self.settings.fan_mins_per_hour);

        let identity = active.identity();
        debug!(
            device = %self.url,
            mode = mode.as_str(),
            heattemp,
            cooltemp,
            old_state = ?self.state.last_applied,
            new_state = ?identity,
            fan_state = last_fan,
            new_fan_state = fan,
            is_holiday = active.is_holiday,
            is_peak = active.is_peak,
            "resolved"
        );

        if self.state.last_applied.as_ref() != Some(&identity) || last_fan != fan {
            info!(
                device = %self.url,
                mode = mode.as_str(),
                heattemp,
                cooltemp,
                fan,
                is_holiday = active.is_holiday,
                is_peak = active.is_peak,
                "updating thermostat"
            );
            let command = Command {
                mode,
                heattemp,
                cooltemp,
                fan,
            };
            self.client.apply_confirmed(&command, CONFIRM_TRIES).await?;
            self.state.last_applied = Some(identity);
            self.state.fan.set_forced(fan);
        } else {
            debug!(device = %self.url, "already in the desired state");
        }

        self.publish(now, operating, running, Some(&active));
        Ok(())
    }

    async fn power_reading(&self) -> PowerReading {
        match &self.monitor {
            Some(monitor) => monitor.reading_or_zero().await,
            None => PowerReading::default(),
        }
    }

    fn publish(
        &self,
        now: NaiveDateTime,
        operating: OperatingMode,
        running: bool,
        active: Option<&ActiveSetpoint>,
    ) {
        let mut state = self.snapshots.write().unwrap();
        let Some(slot) = state.devices.get_mut(self.slot) else {
            return;
        };
        slot.mode = Some(operating.as_str().to_string());
        slot.running = running;
        slot.target = active.map(|active| active.target);
        slot.is_holiday = active.map_or(false, |active| active.is_holiday);
        slot.is_peak = active.map_or(false, |active| active.is_peak);
        slot.fan_forced = self.state.fan.forced();
        slot.last_update = Some(now.and_utc().timestamp());
        slot.last_on = self.state.last_on.map(|t| t.and_utc().timestamp());
    }
}
