//! Astrometry and helper processes for the running scripts

use crate::executor::ExecEvent;
use obs_config::AstrometryConfig;
use obs_core::{AstrometryResult, ImageInfo, ProcessId};
use obs_script::{LaunchError, Services};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Seconds a simulated astrometric solution takes
const SOLVE_TIME: f64 = 2.0;

enum ProcessInput {
    Line(String),
    Terminate,
}

/// Services backed by the tokio runtime
pub struct ExecServices {
    events: mpsc::UnboundedSender<ExecEvent>,
    astrometry: AstrometryConfig,
    speed: f64,
    solves: u32,
    processes: HashMap<ProcessId, mpsc::UnboundedSender<ProcessInput>>,
    next_pid: u32,
}

impl ExecServices {
    pub fn new(
        astrometry: AstrometryConfig,
        speed: f64,
        events: mpsc::UnboundedSender<ExecEvent>,
    ) -> Self {
        Self {
            events,
            astrometry,
            speed,
            solves: 0,
            processes: HashMap::new(),
            next_pid: 1,
        }
    }
}

impl Services for ExecServices {
    fn request_astrometry(&mut self, device: &str, image: &ImageInfo) -> bool {
        self.solves += 1;
        let fail_every = self.astrometry.fail_every;
        let result = if fail_every > 0 && self.solves % fail_every == 0 {
            AstrometryResult::Failed
        } else {
            AstrometryResult::Solved {
                precision: self.astrometry.precision,
            }
        };
        debug!(device, path = %image.path, result = ?result, "Solving image");

        let delay = Duration::from_secs_f64(SOLVE_TIME / self.speed);
        let events = self.events.clone();
        let (obs_id, img_id) = (image.obs_id, image.img_id);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ExecEvent::Astrometry {
                obs_id,
                img_id,
                result,
            });
        });
        true
    }

    fn launch(&mut self, device: &str, path: &str) -> Result<ProcessId, LaunchError> {
        let mut child = Command::new(path)
            .arg(device)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(LaunchError {
                path: path.to_string(),
                reason: "no pipes to the process".to_string(),
            });
        };

        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        let (input_tx, mut input_rx) = mpsc::unbounded_channel();
        self.processes.insert(pid, input_tx);
        info!(device, path, %pid, "Helper started");

        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let _ = events.send(ExecEvent::ProcessLine { pid, line });
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%pid, error = %e, "Cannot read from helper");
                            break;
                        }
                    },
                    input = input_rx.recv() => match input {
                        Some(ProcessInput::Line(line)) => {
                            let written = stdin.write_all(format!("{}\n", line).as_bytes()).await;
                            if let Err(e) = written {
                                warn!(%pid, error = %e, "Cannot write to helper");
                            }
                        }
                        Some(ProcessInput::Terminate) | None => {
                            let _ = child.kill().await;
                            break;
                        }
                    },
                }
            }
            let _ = child.wait().await;
            let _ = events.send(ExecEvent::ProcessExited { pid });
        });
        Ok(pid)
    }

    fn write_to_process(&mut self, pid: ProcessId, line: &str) {
        match self.processes.get(&pid) {
            Some(input) => {
                let _ = input.send(ProcessInput::Line(line.to_string()));
            }
            None => debug!(%pid, line, "Helper already gone"),
        }
    }

    fn terminate(&mut self, pid: ProcessId) {
        if let Some(input) = self.processes.remove(&pid) {
            debug!(%pid, "Terminating helper");
            let _ = input.send(ProcessInput::Terminate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(fail_every: u32) -> (ExecServices, mpsc::UnboundedReceiver<ExecEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let astrometry = AstrometryConfig {
            precision: 0.02,
            fail_every,
        };
        (ExecServices::new(astrometry, 1000.0, tx), rx)
    }

    fn image(img_id: i32) -> ImageInfo {
        ImageInfo {
            obs_id: 3,
            img_id,
            path: format!("/images/{}.fits", img_id),
        }
    }

    #[tokio::test]
    async fn test_astrometry_fails_every_nth() {
        let (mut services, mut rx) = services(2);
        assert!(services.request_astrometry("C0", &image(1)));
        assert!(services.request_astrometry("C0", &image(2)));

        let mut results = Vec::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(ExecEvent::Astrometry { img_id, result, .. }) => results.push((img_id, result)),
                other => panic!("expected astrometry, got {:?}", other),
            }
        }
        results.sort_by_key(|(img_id, _)| *img_id);
        assert_eq!(results[0].1, AstrometryResult::Solved { precision: 0.02 });
        assert_eq!(results[1].1, AstrometryResult::Failed);
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let (mut services, _rx) = services(0);
        let err = services.launch("C0", "/nonexistent/helper").unwrap_err();
        assert_eq!(err.path, "/nonexistent/helper");
        assert!(services.processes.is_empty());
    }
}
