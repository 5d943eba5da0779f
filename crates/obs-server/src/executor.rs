//! The executor loop
//!
//! One task owns the dispatcher. Device completions, astrometry results and
//! helper output arrive through a single channel, so every script sees the
//! events one at a time and in arrival order.

use crate::services::ExecServices;
use crate::sim::Simulator;
use anyhow::Result;
use chrono::Utc;
use obs_config::ExecConfig;
use obs_core::events::{
    ScriptEndedData, TargetDisabledData, TelescopeChangeData, TelescopeResyncData,
};
use obs_core::{AstrometryResult, Context, ImageInfo, ProcessId, Target};
use obs_event_bus::{NotificationBus, Subscription};
use obs_script::{
    DevScript, DevScriptSettings, DeviceConnection, DeviceTiming, DispatchResult, Dispatcher,
};
use obs_value_store::ValueStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Something happened outside the executor task
#[derive(Debug, Clone)]
pub enum ExecEvent {
    ExposureStarted { device: String },
    ExposureEnd { device: String, expect_image: bool },
    ReadoutEnd { device: String },
    ImageReady { device: String, image: ImageInfo },
    MoveOk,
    MoveFailed,
    Astrometry {
        obs_id: i32,
        img_id: i32,
        result: AstrometryResult,
    },
    ProcessLine { pid: ProcessId, line: String },
    ProcessExited { pid: ProcessId },
}

/// Counters reported when the run ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub targets: usize,
    pub scripts_ended: usize,
    pub targets_disabled: usize,
}

/// Drives every configured device through the configured targets
pub struct Executor {
    dispatcher: Dispatcher,
    simulator: Simulator,
    values: Arc<ValueStore>,
    idle_interval: Duration,

    targets: VecDeque<Arc<Target>>,
    current: Option<Arc<Target>>,

    events_rx: mpsc::UnboundedReceiver<ExecEvent>,
    telescope_changes: Subscription<TelescopeChangeData>,
    telescope_resyncs: Subscription<TelescopeResyncData>,
    script_ends: Subscription<ScriptEndedData>,
    disabled: Subscription<TargetDisabledData>,
    summary: RunSummary,
}

impl Executor {
    pub fn new(config: &ExecConfig, notifications: Arc<NotificationBus>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let values = Arc::new(ValueStore::new(notifications.clone()));

        let services = ExecServices::new(
            config.astrometry.clone(),
            config.observatory.simulation_speed,
            events_tx.clone(),
        );
        let mut dispatcher = Dispatcher::new(Box::new(services));
        for (name, device) in &config.devices {
            for (value_name, value) in &device.values {
                values.set(name, value_name, value.clone(), Context::for_device(name.clone()));
            }
            if !device.kind.runs_scripts() {
                continue;
            }
            let settings = DevScriptSettings {
                call_script_ends: config.observatory.call_script_ends,
                timing: DeviceTiming {
                    readout_time: device.readout_time,
                    filter_movement: device.filter_movement,
                    telescope_speed: config.observatory.telescope_speed,
                },
            };
            dispatcher.add_connection(DevScript::new(
                DeviceConnection::new(name.clone(), device.kind),
                settings,
                values.clone(),
                notifications.clone(),
            ));
        }

        Self {
            dispatcher,
            simulator: Simulator::new(config, events_tx),
            values,
            idle_interval: Duration::from_secs_f64(config.observatory.idle_interval),
            targets: config.build_targets().into_iter().map(Arc::new).collect(),
            current: None,
            events_rx,
            telescope_changes: notifications.subscribe(),
            telescope_resyncs: notifications.subscribe(),
            script_ends: notifications.subscribe(),
            disabled: notifications.subscribe(),
            summary: RunSummary::default(),
        }
    }

    pub fn values(&self) -> &Arc<ValueStore> {
        &self.values
    }

    /// Run until every target was observed or the process is interrupted
    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut idle = tokio::time::interval(self.idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        self.start_next_target();
        self.settle();

        while !self.finished() {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = idle.tick() => self.dispatcher.idle(Utc::now()),
                result = &mut ctrl_c => {
                    result?;
                    info!("Interrupted, killing scripts");
                    self.dispatcher.kill_all();
                    self.settle();
                    break;
                }
            }
            self.settle();
            if self.dispatcher.is_idle() {
                self.start_next_target();
                self.settle();
            }
        }

        info!(
            targets = self.summary.targets,
            scripts_ended = self.summary.scripts_ended,
            targets_disabled = self.summary.targets_disabled,
            "Run finished"
        );
        Ok(self.summary)
    }

    fn finished(&self) -> bool {
        self.targets.is_empty() && self.dispatcher.is_idle()
    }

    #[instrument(skip(self))]
    fn start_next_target(&mut self) {
        let Some(target) = self.targets.pop_front() else {
            self.current = None;
            return;
        };
        info!(
            target_id = target.target_id,
            obs_id = target.obs_id,
            name = %target.name,
            "Starting target"
        );
        self.summary.targets += 1;
        self.simulator.slew(target.position);
        self.current = Some(target.clone());
        self.dispatcher.set_target(target);

        let telescope = self.simulator.telescope().copied();
        for connection in self.dispatcher.connections() {
            if let Some(script) = connection.script() {
                debug!(
                    device = %connection.name(),
                    duration = script.expected_duration(telescope.as_ref()),
                    light_time = script.expected_light_time(),
                    images = script.expected_images(),
                    "Script estimate"
                );
            }
        }
    }

    fn handle(&mut self, event: ExecEvent) {
        let result: DispatchResult<()> = match event {
            ExecEvent::ExposureStarted { device } => self.dispatcher.exposure_started(&device),
            ExecEvent::ExposureEnd {
                device,
                expect_image,
            } => self.dispatcher.exposure_end(&device, expect_image),
            ExecEvent::ReadoutEnd { device } => self.dispatcher.readout_end(&device),
            ExecEvent::ImageReady { device, image } => {
                debug!(device = %device, path = %image.path, "Image written");
                self.dispatcher.image_ready(&device, &image)
            }
            ExecEvent::MoveOk => {
                self.dispatcher.move_ok();
                Ok(())
            }
            ExecEvent::MoveFailed => {
                self.dispatcher.move_failed();
                Ok(())
            }
            ExecEvent::Astrometry {
                obs_id,
                img_id,
                result,
            } => {
                self.dispatcher.deliver_astrometry(obs_id, img_id, result);
                Ok(())
            }
            ExecEvent::ProcessLine { pid, line } => {
                self.dispatcher.process_line(pid, &line);
                Ok(())
            }
            ExecEvent::ProcessExited { pid } => {
                self.dispatcher.process_exited(pid);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Dropping device event");
        }
    }

    /// Send queued commands and react to what the scripts published
    fn settle(&mut self) {
        loop {
            let commands = self.dispatcher.take_commands();
            if commands.is_empty() {
                break;
            }
            let obs_id = self.current.as_ref().map_or(-1, |t| t.obs_id);
            for (device, out) in commands {
                let acked = match self.simulator.execute(&out.command, obs_id, &self.values) {
                    Ok(()) => self.dispatcher.command_ok(&device, out.id),
                    Err(e) => {
                        warn!(device = %device, command = %out.command, error = %e, "Command failed");
                        self.dispatcher.command_failed(&device, out.id)
                    }
                };
                if let Err(e) = acked {
                    warn!(error = %e, "Cannot acknowledge command");
                }
            }
        }

        for change in self.telescope_changes.drain() {
            self.simulator.offset(change.data.ra, change.data.dec);
        }
        if !self.telescope_resyncs.drain().is_empty() {
            let position = self.current.as_ref().and_then(|t| t.position);
            self.simulator.slew(position);
        }
        for ended in self.script_ends.drain() {
            debug!(device = %ended.data.device, executed = ended.data.executed, "Script ended");
            self.summary.scripts_ended += 1;
        }
        for disabled in self.disabled.drain() {
            warn!(
                device = %disabled.data.device,
                target_id = disabled.data.target_id,
                reason = %disabled.data.reason,
                "Target disabled"
            );
            self.summary.targets_disabled += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> ExecConfig {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        ExecConfig::from_yaml(&value).unwrap()
    }

    const CONFIG: &str = r#"
observatory:
  simulation_speed: 1000
  idle_interval: 0.01
devices:
  C0:
    kind: camera
    readout_time: 2
  C1:
    kind: camera
  T0:
    kind: telescope
targets:
  - id: 1
    obs_id: 10
    name: m31
    ra: 10.68
    dec: 41.27
    scripts:
      C0: "filter=2 E 5 SS 1"
      C1: "SW 1 E 3"
  - id: 2
    obs_id: 11
    name: broken
    scripts:
      C0: "E"
      C1: "E 1"
"#;

    #[tokio::test]
    async fn test_runs_all_targets() {
        let notifications = Arc::new(NotificationBus::new());
        let mut executor = Executor::new(&config(CONFIG), notifications);
        let summary = tokio::time::timeout(Duration::from_secs(10), executor.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.targets, 2);
        assert!(summary.scripts_ended >= 3);
        assert_eq!(summary.targets_disabled, 1);
        assert_eq!(executor.values().get_f64("C0", "filter"), Some(2.0));
    }

    #[tokio::test]
    async fn test_loads_configuration_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exec.yaml"), CONFIG).unwrap();
        let config = ExecConfig::load(dir.path(), "exec.yaml").unwrap();

        let executor = Executor::new(&config, Arc::new(NotificationBus::new()));
        assert_eq!(executor.dispatcher.connections().len(), 2);
        assert_eq!(executor.targets.len(), 2);
    }

    #[tokio::test]
    async fn test_offset_waits_for_simulated_move() {
        let yaml = r#"
observatory:
  simulation_speed: 1000
  idle_interval: 0.01
devices:
  C0:
    kind: camera
targets:
  - id: 1
    obs_id: 10
    name: field
    ra: 100
    dec: -20
    scripts:
      C0: "C 0.5 0 E 1 C -0.5 0 E 1"
"#;
        let notifications = Arc::new(NotificationBus::new());
        let mut executor = Executor::new(&config(yaml), notifications);
        let summary = tokio::time::timeout(Duration::from_secs(10), executor.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.targets, 1);
        assert_eq!(summary.targets_disabled, 0);
        assert!((executor.simulator.telescope().unwrap().ra - 100.0).abs() < 1e-9);
    }
}
