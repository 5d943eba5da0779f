//! Owner of every connection's script controller
//!
//! The dispatcher routes device events to the right [`DevScript`] and is the
//! [`ScriptBus`] its scripts see: queries go to the other connections at
//! once, while sent signals and acquisition results are queued and
//! delivered after the call that produced them returns.

use crate::bus::{ScriptBus, Services};
use crate::devscript::{DevScript, Outgoing};
use crate::error::LaunchError;
use chrono::{DateTime, Utc};
use obs_core::events::AcquisitionOutcome;
use obs_core::{AstrometryResult, ImageInfo, ProcessId, Target};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Dispatcher errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no script connection named {0}")]
    UnknownDevice(String),
}

/// Result type for dispatcher operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Follow-up work produced while a connection handled an event
#[derive(Debug, Clone, Copy)]
enum Deferred {
    Signal { from: usize, signal: i32 },
    AcquisitionEnd { from: usize, outcome: AcquisitionOutcome },
}

/// The bus seen by one connection: every other connection plus the services
struct PeerBus<'a> {
    peers: Vec<&'a mut DevScript>,
    services: &'a mut dyn Services,
    from: usize,
    deferred: &'a mut VecDeque<Deferred>,
}

impl Services for PeerBus<'_> {
    fn request_astrometry(&mut self, device: &str, image: &ImageInfo) -> bool {
        self.services.request_astrometry(device, image)
    }

    fn launch(&mut self, device: &str, path: &str) -> Result<ProcessId, LaunchError> {
        self.services.launch(device, path)
    }

    fn write_to_process(&mut self, pid: ProcessId, line: &str) {
        self.services.write_to_process(pid, line);
    }

    fn terminate(&mut self, pid: ProcessId) {
        self.services.terminate(pid);
    }
}

impl ScriptBus for PeerBus<'_> {
    fn send_signal(&mut self, signal: i32) {
        self.deferred.push_back(Deferred::Signal {
            from: self.from,
            signal,
        });
    }

    fn will_send(&mut self, signal: i32) -> bool {
        // only the first sender is marked as awaited
        self.peers.iter_mut().any(|peer| peer.will_send(signal))
    }

    fn acquire_query(&mut self, obs_target_id: i32) -> i32 {
        self.peers
            .iter()
            .map(|peer| peer.acquire_query(obs_target_id))
            .sum()
    }

    fn acquisition_ended(&mut self, outcome: AcquisitionOutcome) {
        self.deferred.push_back(Deferred::AcquisitionEnd {
            from: self.from,
            outcome,
        });
    }
}

/// Single owner of all script controllers
pub struct Dispatcher {
    connections: Vec<DevScript>,
    services: Box<dyn Services + Send>,
    deferred: VecDeque<Deferred>,
}

impl Dispatcher {
    pub fn new(services: Box<dyn Services + Send>) -> Self {
        Self {
            connections: Vec::new(),
            services,
            deferred: VecDeque::new(),
        }
    }

    pub fn add_connection(&mut self, connection: DevScript) {
        debug!(device = %connection.name(), "Adding script connection");
        self.connections.push(connection);
    }

    pub fn connections(&self) -> &[DevScript] {
        &self.connections
    }

    pub fn get(&self, device: &str) -> Option<&DevScript> {
        self.connections.iter().find(|c| c.name() == device)
    }

    fn index(&self, device: &str) -> DispatchResult<usize> {
        self.connections
            .iter()
            .position(|c| c.name() == device)
            .ok_or_else(|| DispatchError::UnknownDevice(device.to_string()))
    }

    /// Call `f` on one connection with the others as its bus
    fn route<R>(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut DevScript, &mut dyn ScriptBus) -> R,
    ) -> Option<R> {
        if idx >= self.connections.len() {
            return None;
        }
        let (before, rest) = self.connections.split_at_mut(idx);
        let (connection, after) = rest.split_first_mut()?;
        let mut bus = PeerBus {
            peers: before.iter_mut().chain(after.iter_mut()).collect(),
            services: self.services.as_mut(),
            from: idx,
            deferred: &mut self.deferred,
        };
        Some(f(connection, &mut bus))
    }

    /// Deliver queued signals and acquisition results, then open barriers
    ///
    /// A connection passes the barrier at most once per call, so a script
    /// that reaches `W` again right after its release waits for the next event.
    fn settle(&mut self) {
        let mut released = vec![false; self.connections.len()];
        loop {
            while let Some(work) = self.deferred.pop_front() {
                match work {
                    Deferred::Signal { from, signal } => {
                        let consumer = (0..self.connections.len())
                            .filter(|&i| i != from)
                            .find(|&i| {
                                self.route(i, |c, bus| c.deliver_signal(signal, bus))
                                    .unwrap_or(false)
                            });
                        trace!(signal, consumer = ?consumer, "Signal delivered");
                    }
                    Deferred::AcquisitionEnd { from, outcome } => {
                        for i in (0..self.connections.len()).filter(|&i| i != from) {
                            self.route(i, |c, bus| c.acquisition_end(outcome, bus));
                        }
                    }
                }
            }
            if !self.release_barrier(&mut released) {
                return;
            }
        }
    }

    /// Release the `W` barrier once every running script reached it
    ///
    /// Connections already marked in `released` stay where they are; false
    /// when nobody was released.
    fn release_barrier(&mut self, released: &mut [bool]) -> bool {
        let mut running = self.connections.iter().filter(|c| c.has_script()).peekable();
        if running.peek().is_none() || !running.all(DevScript::at_barrier) {
            return false;
        }
        let waiting: Vec<usize> = (0..self.connections.len())
            .filter(|&i| self.connections[i].at_barrier() && !released[i])
            .collect();
        if waiting.is_empty() {
            trace!("Barrier already released in this round");
            return false;
        }
        debug!("All connections reached the barrier");
        for i in waiting {
            released[i] = true;
            self.route(i, |c, bus| c.clear_wait(bus));
        }
        true
    }

    fn on_device<R>(
        &mut self,
        device: &str,
        f: impl FnOnce(&mut DevScript, &mut dyn ScriptBus) -> R,
    ) -> DispatchResult<R> {
        let idx = self.index(device)?;
        let result = self
            .route(idx, f)
            .ok_or_else(|| DispatchError::UnknownDevice(device.to_string()))?;
        self.settle();
        Ok(result)
    }

    fn on_all(&mut self, mut f: impl FnMut(&mut DevScript, &mut dyn ScriptBus)) {
        for i in 0..self.connections.len() {
            self.route(i, &mut f);
        }
        self.settle();
    }

    /// Assign `target` to every connection
    pub fn set_target(&mut self, target: Arc<Target>) {
        self.on_all(|c, bus| c.set_target(target.clone(), bus));
    }

    pub fn set_target_kill(&mut self, target: Arc<Target>) {
        self.on_all(|c, bus| c.set_target_kill(target.clone(), bus));
    }

    pub fn kill_all(&mut self) {
        self.on_all(|c, bus| c.kill_all(bus));
    }

    pub fn stop_target(&mut self) {
        self.on_all(|c, bus| c.stop_target(bus));
    }

    pub fn stop_observation(&mut self) {
        self.on_all(|c, bus| c.stop_observation(bus));
    }

    /// The telescope finished moving
    pub fn move_ok(&mut self) {
        self.on_all(|c, bus| c.move_ok(bus));
    }

    pub fn move_failed(&mut self) {
        self.on_all(|c, bus| c.move_failed(bus));
    }

    pub fn clear_wait(&mut self) {
        self.on_all(|c, bus| c.clear_wait(bus));
    }

    pub fn command_ok(&mut self, device: &str, id: u64) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.command_ok(id, bus))
    }

    pub fn command_failed(&mut self, device: &str, id: u64) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.command_failed(id, bus))
    }

    pub fn exposure_started(&mut self, device: &str) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.exposure_started(bus))
    }

    pub fn exposure_end(&mut self, device: &str, expect_image: bool) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.exposure_end(expect_image, bus))
    }

    pub fn exposure_failed(&mut self, device: &str) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.exposure_failed(bus))
    }

    pub fn readout_end(&mut self, device: &str) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.readout_end(bus))
    }

    pub fn image_ready(&mut self, device: &str, image: &ImageInfo) -> DispatchResult<()> {
        self.on_device(device, |c, bus| c.image_ready(image, bus))
    }

    /// Hand an astrometric result to the script that asked for it
    pub fn deliver_astrometry(&mut self, obs_id: i32, img_id: i32, result: AstrometryResult) -> bool {
        let taken = (0..self.connections.len())
            .any(|i| {
                self.route(i, |c, bus| c.astrometry_result(obs_id, img_id, result, bus))
                    .unwrap_or(false)
            });
        if !taken {
            debug!(obs_id, img_id, "Astrometry result nobody waits for");
        }
        self.settle();
        taken
    }

    /// Offer `signal` to every connection as if sent from outside
    pub fn deliver_signal(&mut self, signal: i32) -> bool {
        let consumed = (0..self.connections.len())
            .any(|i| {
                self.route(i, |c, bus| c.deliver_signal(signal, bus))
                    .unwrap_or(false)
            });
        self.settle();
        consumed
    }

    pub fn process_line(&mut self, pid: ProcessId, line: &str) -> bool {
        let owned = (0..self.connections.len())
            .any(|i| {
                self.route(i, |c, bus| c.process_line(pid, line, bus))
                    .unwrap_or(false)
            });
        if !owned {
            warn!(%pid, line, "Line from unknown helper process");
        }
        self.settle();
        owned
    }

    pub fn process_exited(&mut self, pid: ProcessId) -> bool {
        let owned = (0..self.connections.len())
            .any(|i| {
                self.route(i, |c, bus| c.process_exited(pid, bus))
                    .unwrap_or(false)
            });
        self.settle();
        owned
    }

    pub fn idle(&mut self, now: DateTime<Utc>) {
        self.on_all(|c, bus| c.idle(now, bus));
    }

    /// Commands of every connection, by device
    pub fn take_commands(&mut self) -> Vec<(String, Outgoing)> {
        self.connections
            .iter_mut()
            .flat_map(|c| {
                let name = c.name().to_string();
                c.take_commands().into_iter().map(move |out| (name.clone(), out))
            })
            .collect()
    }

    /// No connection runs or waits to run a script
    pub fn is_idle(&self) -> bool {
        self.connections
            .iter()
            .all(|c| !c.has_script() && c.next_target().is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeviceConnection, LocalBus};
    use crate::devscript::{DevScriptSettings, WaitState};
    use obs_core::DeviceKind;
    use obs_event_bus::NotificationBus;
    use obs_value_store::ValueStore;

    fn dispatcher(devices: &[&str]) -> Dispatcher {
        let notifications = Arc::new(NotificationBus::new());
        let values = Arc::new(ValueStore::new(notifications.clone()));
        let mut dispatcher = Dispatcher::new(Box::new(LocalBus::new()));
        for name in devices {
            dispatcher.add_connection(DevScript::new(
                DeviceConnection::new(*name, DeviceKind::Camera),
                DevScriptSettings::default(),
                values.clone(),
                notifications.clone(),
            ));
        }
        dispatcher
    }

    /// Acknowledge everything sent so far, returning the commands as text
    fn ack_all(dispatcher: &mut Dispatcher) -> Vec<String> {
        let mut sent = Vec::new();
        loop {
            let batch = dispatcher.take_commands();
            if batch.is_empty() {
                return sent;
            }
            for (device, out) in batch {
                dispatcher.command_ok(&device, out.id).unwrap();
                sent.push(out.command.to_string());
            }
        }
    }

    fn expose(dispatcher: &mut Dispatcher, device: &str) {
        dispatcher.exposure_started(device).unwrap();
        dispatcher.exposure_end(device, false).unwrap();
    }

    #[test]
    fn test_signal_between_connections() {
        let mut d = dispatcher(&["C0", "C1"]);
        let target = Target::new(5, 50, "t")
            .with_script("C0", "SW 3 E 1")
            .with_script("C1", "E 2 SS 3");
        d.set_target(Arc::new(target));

        let sent = ack_all(&mut d);
        assert!(sent.contains(&"C1.expose 2".to_string()));
        assert!(!sent.contains(&"C0.expose 1".to_string()));
        assert_eq!(d.get("C0").map(DevScript::wait_state), Some(WaitState::WaitSignal));

        expose(&mut d, "C1");
        let sent = ack_all(&mut d);
        assert_eq!(sent, vec!["C0.expose 1"]);
        assert!(!d.get("C1").is_some_and(DevScript::has_script));
    }

    #[test]
    fn test_signal_consumed_once() {
        let mut d = dispatcher(&["C0", "C1", "C2"]);
        let target = Target::new(5, 50, "t")
            .with_script("C0", "SW 3 E 1")
            .with_script("C1", "SW 3 E 1")
            .with_script("C2", "E 5 SS 3 E 6");
        d.set_target(Arc::new(target));
        ack_all(&mut d);

        expose(&mut d, "C2");
        let sent = ack_all(&mut d);
        assert!(sent.contains(&"C0.expose 1".to_string()));
        assert!(sent.contains(&"C2.expose 6".to_string()));
        assert!(!sent.contains(&"C1.expose 1".to_string()));
        assert_eq!(d.get("C1").map(DevScript::wait_state), Some(WaitState::WaitSignal));
    }

    #[test]
    fn test_barrier_waits_for_everyone() {
        let mut d = dispatcher(&["C0", "C1"]);
        let target = Target::new(5, 50, "t")
            .with_script("C0", "E 1 W E 2")
            .with_script("C1", "W E 3");
        d.set_target(Arc::new(target));

        let sent = ack_all(&mut d);
        assert!(sent.contains(&"C0.expose 1".to_string()));
        assert!(d.get("C1").is_some_and(DevScript::at_barrier));
        assert!(!d.get("C0").is_some_and(DevScript::at_barrier));

        expose(&mut d, "C0");
        let sent = ack_all(&mut d);
        assert!(sent.contains(&"C0.expose 2".to_string()));
        assert!(sent.contains(&"C1.expose 3".to_string()));
        assert!(!d.get("C1").is_some_and(DevScript::at_barrier));
    }

    #[test]
    fn test_barrier_inside_signal_block_returns() {
        let mut d = dispatcher(&["C0"]);
        d.set_target(Arc::new(Target::new(5, 50, "t").with_script("C0", "BS 7 { W }")));
        ack_all(&mut d);
        assert!(d.get("C0").is_some_and(DevScript::at_barrier));

        d.idle(Utc::now());
        assert!(d.get("C0").is_some_and(DevScript::at_barrier));

        assert!(d.deliver_signal(7));
        ack_all(&mut d);
        assert!(d.is_idle());
    }

    #[test]
    fn test_only_first_sender_is_awaited() {
        let notifications = Arc::new(NotificationBus::new());
        let values = Arc::new(ValueStore::new(notifications.clone()));
        let target = Arc::new(
            Target::new(5, 50, "t")
                .with_script("C1", "E 2 SS 3")
                .with_script("C2", "E 4 SS 3"),
        );
        let mut senders: Vec<DevScript> = ["C1", "C2"]
            .into_iter()
            .map(|name| {
                let mut dev = DevScript::new(
                    DeviceConnection::new(name, DeviceKind::Camera),
                    DevScriptSettings::default(),
                    values.clone(),
                    notifications.clone(),
                );
                dev.set_target(target.clone(), &mut LocalBus::new());
                dev
            })
            .collect();

        let mut services = LocalBus::new();
        let mut deferred = VecDeque::new();
        let mut bus = PeerBus {
            peers: senders.iter_mut().collect(),
            services: &mut services,
            from: 0,
            deferred: &mut deferred,
        };
        assert!(bus.will_send(3));

        let mut first = LocalBus::new();
        let mut second = LocalBus::new();
        senders[0].stop_observation(&mut first);
        senders[1].stop_observation(&mut second);
        assert_eq!(first.sent_signals, vec![3]);
        assert!(second.sent_signals.is_empty());
    }

    #[test]
    fn test_acquisition_releases_slaves() {
        let mut d = dispatcher(&["C0", "C1"]);
        let target = Target::new(5, 50, "t")
            .with_script("C0", "A 0.1 5 E 10")
            .with_script("C1", "Aw E 1");
        d.set_target(Arc::new(target));
        let sent = ack_all(&mut d);
        assert!(sent.contains(&"C0.expose 5".to_string()));
        assert_eq!(d.get("C1").map(DevScript::wait_state), Some(WaitState::WaitSlave));

        expose(&mut d, "C0");
        let image = ImageInfo {
            obs_id: 50,
            img_id: 1,
            path: "a.fits".to_string(),
        };
        d.image_ready("C0", &image).unwrap();
        assert!(d.deliver_astrometry(50, 1, AstrometryResult::Solved { precision: 0.05 }));

        let sent = ack_all(&mut d);
        assert!(sent.contains(&"C0.expose 10".to_string()));
        assert!(sent.contains(&"C1.expose 1".to_string()));
    }

    #[test]
    fn test_unmatched_astrometry_is_ignored() {
        let mut d = dispatcher(&["C0"]);
        d.set_target(Arc::new(Target::new(5, 50, "t").with_script("C0", "E 1")));
        ack_all(&mut d);
        assert!(!d.deliver_astrometry(50, 9, AstrometryResult::Failed));
        assert!(d.get("C0").is_some_and(DevScript::has_script));
    }

    #[test]
    fn test_unknown_device() {
        let mut d = dispatcher(&["C0"]);
        assert!(matches!(
            d.command_ok("C9", 1),
            Err(DispatchError::UnknownDevice(name)) if name == "C9"
        ));
    }

    #[test]
    fn test_is_idle_after_scripts_end() {
        let mut d = dispatcher(&["C0"]);
        assert!(d.is_idle());
        d.set_target(Arc::new(Target::new(5, 50, "t").with_script("C0", "E 1")));
        ack_all(&mut d);
        assert!(!d.is_idle());
        expose(&mut d, "C0");
        assert!(d.is_idle());
    }
}
