//! Acquisition: expose, solve, and decide whether the pointing is good enough

use crate::status::{Reply, Status};
use obs_core::{AstrometryResult, BopMask, Command, ImageInfo, ValueOp};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Where the acquisition loop stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireState {
    NeedImage,
    WaitingImage,
    WaitingAstrometry,
    PrecisionOk,
    /// Measured error improved but is still too large; take another image
    PrecisionBad,
    Failed,
}

/// State of one acquire element
#[derive(Debug, Clone)]
pub struct Acquisition {
    /// Required precision in degrees
    pub precision: f64,
    /// Acquisition exposure in seconds
    pub exposure: f64,
    state: AcquireState,
    last_precision: f64,
    image: Option<(i32, i32)>,
}

impl Acquisition {
    pub fn new(precision: f64, exposure: f64) -> Self {
        Self {
            precision,
            exposure,
            state: AcquireState::NeedImage,
            last_precision: f64::NAN,
            image: None,
        }
    }

    pub fn state(&self) -> AcquireState {
        self.state
    }

    /// `(obs_id, img_id)` of the image being processed
    pub fn image(&self) -> Option<(i32, i32)> {
        self.image
    }

    /// One poll of the acquisition
    ///
    /// `queued` receives the value changes that must precede the exposure.
    pub fn next_command(&mut self, device: &str, queued: &mut Vec<Command>) -> Reply {
        match self.state {
            AcquireState::NeedImage => {
                queued.push(Command::change_value(device, "SHUTTER", ValueOp::Set, "0"));
                queued.push(Command::change_value(
                    device,
                    "exposure",
                    ValueOp::Set,
                    self.exposure.to_string(),
                ));
                self.state = AcquireState::WaitingImage;
                Reply::command(
                    Status::AcquisitionImage,
                    Command::exposure(device, self.exposure, true).with_bop(BopMask::EXPOSURE),
                )
            }
            AcquireState::WaitingImage | AcquireState::WaitingAstrometry => {
                Reply::status(Status::Waiting)
            }
            AcquireState::Failed => Reply::status(Status::PrecisionFailed),
            AcquireState::PrecisionOk => Reply::status(Status::PrecisionOk),
            AcquireState::PrecisionBad => {
                self.state = AcquireState::NeedImage;
                Reply::status(Status::Resync)
            }
        }
    }

    /// An image arrived; returns whether it was taken by this acquisition
    pub fn image_ready(&mut self, image: &ImageInfo) -> bool {
        if self.state != AcquireState::WaitingImage {
            return false;
        }
        self.image = Some((image.obs_id, image.img_id));
        true
    }

    /// Outcome of asking for astrometry on the image
    pub fn astrometry_requested(&mut self, accepted: bool) {
        self.state = if accepted {
            AcquireState::WaitingAstrometry
        } else {
            warn!("Astrometry request rejected, acquisition failed");
            AcquireState::Failed
        };
    }

    /// Astrometry finished for `(obs_id, img_id)`; unmatched results are ignored
    pub fn astrometry_result(&mut self, obs_id: i32, img_id: i32, result: AstrometryResult) -> bool {
        if self.state != AcquireState::WaitingAstrometry || self.image != Some((obs_id, img_id)) {
            return false;
        }
        self.state = match result {
            AstrometryResult::Solved { precision } if precision.is_nan() => AcquireState::Failed,
            AstrometryResult::Solved { precision } if precision <= self.precision => {
                info!(precision, required = self.precision, "Acquisition precision reached");
                AcquireState::PrecisionOk
            }
            AstrometryResult::Solved { precision }
                if self.last_precision.is_nan() || precision < self.last_precision / 2.0 =>
            {
                debug!(
                    precision,
                    last = self.last_precision,
                    "Acquisition improving, taking another image"
                );
                self.last_precision = precision;
                AcquireState::PrecisionBad
            }
            AstrometryResult::Solved { precision } => {
                warn!(
                    precision,
                    last = self.last_precision,
                    "Acquisition does not converge"
                );
                AcquireState::Failed
            }
            AstrometryResult::Failed => AcquireState::Failed,
        };
        true
    }

    /// The exposure failed or the acquisition was cancelled
    pub fn fail(&mut self) {
        self.state = AcquireState::Failed;
    }

    /// Expected duration given the camera readout time
    pub fn expected_duration(&self, readout_time: f64) -> f64 {
        (self.exposure + readout_time) * 3.0 + 300.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(obs_id: i32, img_id: i32) -> ImageInfo {
        ImageInfo {
            obs_id,
            img_id,
            path: format!("/images/{}-{}.fits", obs_id, img_id),
        }
    }

    fn solved(acq: &mut Acquisition, precision: f64) {
        let mut queued = Vec::new();
        acq.next_command("C0", &mut queued);
        assert!(acq.image_ready(&image(1, 7)));
        acq.astrometry_requested(true);
        assert!(acq.astrometry_result(1, 7, AstrometryResult::Solved { precision }));
    }

    #[test]
    fn test_first_poll_issues_exposure() {
        let mut acq = Acquisition::new(0.01, 5.0);
        let mut queued = Vec::new();
        let reply = acq.next_command("C0", &mut queued);
        assert_eq!(reply.status, Status::AcquisitionImage);
        assert_eq!(
            reply.command,
            Some(Command::exposure("C0", 5.0, true).with_bop(BopMask::EXPOSURE))
        );
        assert_eq!(queued.len(), 2);
        assert_eq!(acq.next_command("C0", &mut queued).status, Status::Waiting);
    }

    #[test]
    fn test_precision_reached() {
        let mut acq = Acquisition::new(2.0, 5.0);
        solved(&mut acq, 1.5);
        assert_eq!(acq.state(), AcquireState::PrecisionOk);
        assert_eq!(acq.next_command("C0", &mut Vec::new()).status, Status::PrecisionOk);
    }

    #[test]
    fn test_bad_precision_resyncs() {
        let mut acq = Acquisition::new(2.0, 5.0);
        solved(&mut acq, 3.0);
        assert_eq!(acq.state(), AcquireState::PrecisionBad);
        assert_eq!(acq.next_command("C0", &mut Vec::new()).status, Status::Resync);
        assert_eq!(acq.state(), AcquireState::NeedImage);
    }

    #[test]
    fn test_no_convergence_fails() {
        let mut acq = Acquisition::new(2.0, 5.0);
        solved(&mut acq, 3.0);
        acq.next_command("C0", &mut Vec::new());
        solved(&mut acq, 2.5);
        assert_eq!(acq.state(), AcquireState::Failed);
    }

    #[test]
    fn test_unmatched_result_ignored() {
        let mut acq = Acquisition::new(2.0, 5.0);
        acq.next_command("C0", &mut Vec::new());
        acq.image_ready(&image(1, 7));
        acq.astrometry_requested(true);
        assert!(!acq.astrometry_result(1, 8, AstrometryResult::Solved { precision: 0.1 }));
        assert_eq!(acq.state(), AcquireState::WaitingAstrometry);
    }

    #[test]
    fn test_image_outside_wait_ignored() {
        let mut acq = Acquisition::new(2.0, 5.0);
        assert!(!acq.image_ready(&image(1, 1)));
        assert_eq!(acq.expected_duration(5.0), 330.0);
    }
}
