//! Simulated devices
//!
//! Cameras expose and read out on timers, the telescope slews at the
//! configured speed. Completion events go back to the executor loop through
//! its channel. All durations are divided by the simulation speed.

use crate::executor::ExecEvent;
use indexmap::IndexMap;
use obs_config::{DeviceConfig, ExecConfig};
use obs_core::{Command, CommandKind, Context, DeviceValue, EquPosition, ImageInfo};
use obs_value_store::ValueStore;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("no simulated device named {0}")]
    UnknownDevice(String),
}

pub type SimResult<T> = Result<T, SimError>;

/// Every configured device, driven by timers
pub struct Simulator {
    events: mpsc::UnboundedSender<ExecEvent>,
    devices: IndexMap<String, DeviceConfig>,
    speed: f64,
    /// Seconds per degree
    telescope_speed: f64,
    telescope: Option<EquPosition>,
    /// Last image number per device
    images: HashMap<String, i32>,
}

impl Simulator {
    pub fn new(config: &ExecConfig, events: mpsc::UnboundedSender<ExecEvent>) -> Self {
        Self {
            events,
            devices: config.devices.clone(),
            speed: config.observatory.simulation_speed,
            telescope_speed: config.observatory.telescope_speed,
            telescope: None,
            images: HashMap::new(),
        }
    }

    fn scaled(&self, seconds: f64) -> Duration {
        Duration::from_secs_f64((seconds / self.speed).max(0.0))
    }

    /// Carry out one command; an error means the device refused it
    pub fn execute(&mut self, command: &Command, obs_id: i32, values: &ValueStore) -> SimResult<()> {
        let device = self
            .devices
            .get(&command.device)
            .ok_or_else(|| SimError::UnknownDevice(command.device.clone()))?;
        let readout_time = device.readout_time;
        trace!(command = %command, "Simulating command");

        match &command.kind {
            CommandKind::Exposure { length, .. } => {
                self.expose(&command.device, *length, readout_time, obs_id);
            }
            CommandKind::ChangeValue {
                name,
                op,
                value,
                raw,
            } => {
                let context = Context::for_device(command.device.clone());
                if *raw {
                    values.set(&command.device, name, DeviceValue::Text(value.clone()), context);
                } else {
                    values.apply(&command.device, name, *op, value, context);
                }
            }
            CommandKind::Offset { ra, dec } => self.offset(*ra, *dec),
            CommandKind::Box { .. }
            | CommandKind::Center { .. }
            | CommandKind::Integrate { .. }
            | CommandKind::Raw { .. }
            | CommandKind::ScriptEnds
            | CommandKind::KillAll => {}
        }
        Ok(())
    }

    fn expose(&mut self, device: &str, length: f64, readout_time: f64, obs_id: i32) {
        let img_id = {
            let counter = self.images.entry(device.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let exposure = self.scaled(length);
        let readout = self.scaled(readout_time);
        let events = self.events.clone();
        let device = device.to_string();
        debug!(device = %device, length, img_id, "Simulated exposure");

        tokio::spawn(async move {
            let _ = events.send(ExecEvent::ExposureStarted {
                device: device.clone(),
            });
            tokio::time::sleep(exposure).await;
            let _ = events.send(ExecEvent::ExposureEnd {
                device: device.clone(),
                expect_image: true,
            });
            tokio::time::sleep(readout).await;
            let _ = events.send(ExecEvent::ReadoutEnd {
                device: device.clone(),
            });
            let path = format!("/images/{}/{}_{:04}.fits", obs_id, device, img_id);
            let _ = events.send(ExecEvent::ImageReady {
                device,
                image: ImageInfo {
                    obs_id,
                    img_id,
                    path,
                },
            });
        });
    }

    /// Point the telescope at `to`; a position-less target needs no slew
    pub fn slew(&mut self, to: Option<EquPosition>) {
        if to.is_some_and(|p| p.dec.abs() > 90.0) {
            warn!(position = ?to, "Cannot slew to an invalid position");
            let _ = self.events.send(ExecEvent::MoveFailed);
            return;
        }
        let degrees = match (&self.telescope, &to) {
            (Some(from), Some(to)) => from.angular_separation(to),
            _ => 0.0,
        };
        if to.is_some() {
            self.telescope = to;
        }
        self.move_done(degrees);
    }

    /// Offset the telescope by `ra`, `dec` degrees
    pub fn offset(&mut self, ra: f64, dec: f64) {
        if let Some(position) = &mut self.telescope {
            position.ra += ra;
            position.dec += dec;
        }
        self.move_done(ra.hypot(dec));
    }

    fn move_done(&self, degrees: f64) {
        let delay = self.scaled(degrees * self.telescope_speed);
        let events = self.events.clone();
        debug!(degrees, delay_ms = delay.as_millis() as u64, "Simulated telescope move");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ExecEvent::MoveOk);
        });
    }

    pub fn telescope(&self) -> Option<&EquPosition> {
        self.telescope.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::{DeviceKind, ValueOp};
    use obs_event_bus::NotificationBus;
    use std::sync::Arc;

    fn simulator() -> (Simulator, mpsc::UnboundedReceiver<ExecEvent>) {
        let mut config = ExecConfig::default();
        config.observatory.simulation_speed = 1000.0;
        config.devices.insert(
            "C0".to_string(),
            DeviceConfig {
                kind: DeviceKind::Camera,
                readout_time: 2.0,
                ..Default::default()
            },
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (Simulator::new(&config, tx), rx)
    }

    fn values() -> ValueStore {
        ValueStore::new(Arc::new(NotificationBus::new()))
    }

    #[tokio::test]
    async fn test_exposure_events_in_order() {
        let (mut sim, mut rx) = simulator();
        sim.execute(&Command::exposure("C0", 1.0, true), 42, &values())
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ExecEvent::ExposureStarted { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ExecEvent::ExposureEnd {
                expect_image: true,
                ..
            })
        ));
        assert!(matches!(rx.recv().await, Some(ExecEvent::ReadoutEnd { .. })));
        match rx.recv().await {
            Some(ExecEvent::ImageReady { device, image }) => {
                assert_eq!(device, "C0");
                assert_eq!((image.obs_id, image.img_id), (42, 1));
            }
            other => panic!("expected an image, got {:?}", other),
        }
    }

    #[test]
    fn test_change_value_updates_store() {
        let (mut sim, _rx) = simulator();
        let values = values();
        sim.execute(&Command::change_value("C0", "gain", ValueOp::Set, "2"), 1, &values)
            .unwrap();
        sim.execute(&Command::change_value("C0", "gain", ValueOp::Add, "3"), 1, &values)
            .unwrap();
        assert_eq!(values.get_f64("C0", "gain"), Some(5.0));

        let raw = Command::change_value("C0", "SCRIPT", ValueOp::Set, "E 1").with_raw_value();
        sim.execute(&raw, 1, &values).unwrap();
        assert_eq!(values.get("C0", "SCRIPT"), Some(DeviceValue::Text("E 1".to_string())));
    }

    #[test]
    fn test_unknown_device_refused() {
        let (mut sim, _rx) = simulator();
        let result = sim.execute(&Command::exposure("C9", 1.0, true), 1, &values());
        assert!(matches!(result, Err(SimError::UnknownDevice(name)) if name == "C9"));
    }

    #[tokio::test]
    async fn test_slew_reports_move() {
        let (mut sim, mut rx) = simulator();
        sim.slew(Some(EquPosition::new(10.0, 20.0)));
        assert!(matches!(rx.recv().await, Some(ExecEvent::MoveOk)));
        sim.offset(1.0, 0.0);
        assert!(matches!(rx.recv().await, Some(ExecEvent::MoveOk)));
        assert_eq!(sim.telescope().map(|p| p.ra), Some(11.0));
    }

    #[tokio::test]
    async fn test_invalid_slew_fails() {
        let (mut sim, mut rx) = simulator();
        sim.slew(Some(EquPosition::new(10.0, 95.0)));
        assert!(matches!(rx.recv().await, Some(ExecEvent::MoveFailed)));
        assert!(sim.telescope().is_none());
    }
}
