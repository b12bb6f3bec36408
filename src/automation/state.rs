//! Per-address state machine.
//!
//! The state machine sequences through:
//! NotStarted → CaptureChecked → CaptureDone → BlenderOpened → MatchedAndCropped
//! → SaveSignalReceived → Done
//!
//! An invalid capture loops back to CaptureChecked a bounded number of times.
//! Any stage error ends in Failed.

use anyhow::Result;
use std::time::Instant;

use crate::address::Job;
use crate::matching::CropRegion;

#[derive(Debug, Clone, PartialEq)]
pub enum AddressState {
    NotStarted,
    /// Skip check passed; the capture is (re)taken from here
    CaptureChecked,
    CaptureDone,
    BlenderOpened,
    MatchedAndCropped,
    SaveSignalReceived,
    Done,
    Failed(String),
}

impl std::fmt::Display for AddressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressState::NotStarted => write!(f, "Not started"),
            AddressState::CaptureChecked => write!(f, "Capture checked"),
            AddressState::CaptureDone => write!(f, "Capture done"),
            AddressState::BlenderOpened => write!(f, "Blender opened"),
            AddressState::MatchedAndCropped => write!(f, "Matched and cropped"),
            AddressState::SaveSignalReceived => write!(f, "Save signal received"),
            AddressState::Done => write!(f, "Done"),
            AddressState::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddressOutcome {
    Succeeded,
    /// The project file already existed
    Skipped,
    Failed(String),
}

impl AddressOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            AddressOutcome::Succeeded => "succeeded",
            AddressOutcome::Skipped => "skipped",
            AddressOutcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            AddressOutcome::Failed(msg) => msg,
            _ => "",
        }
    }
}

/// The stage operations sequenced by the state machine.
pub trait Stages {
    /// Geocode, open the map, inject RenderDoc and save a capture to `job.capture_path`.
    fn capture(&mut self, job: &Job) -> Result<()>;

    fn capture_is_valid(&self, job: &Job) -> bool;

    /// Launch Blender and wait until the capture is imported and framed.
    fn open_blender(&mut self, job: &Job) -> Result<()>;

    /// Screenshot Blender, locate the template and send the crop region.
    fn match_and_crop(&mut self, job: &Job) -> Result<CropRegion>;

    fn wait_saved(&mut self, job: &Job) -> Result<()>;

    /// Terminate helper processes left over from a previous address.
    fn reset(&mut self) -> Result<()>;
}

/// Retry and reuse policy for the capture step.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapturePolicy {
    /// Extra attempts after an invalid capture
    pub retries: u32,
    /// Use an existing valid capture instead of recapturing
    pub reuse_existing: bool,
}

pub struct AddressContext<'a> {
    pub state: AddressState,
    pub job: &'a Job,
    policy: CapturePolicy,
    retries_used: u32,
    skipped: bool,
    started: Instant,
}

impl<'a> AddressContext<'a> {
    pub fn new(job: &'a Job, policy: CapturePolicy) -> Self {
        Self {
            state: AddressState::NotStarted,
            job,
            policy,
            retries_used: 0,
            skipped: false,
            started: Instant::now(),
        }
    }

    fn fail(&mut self, what: &str, err: impl std::fmt::Display) -> bool {
        self.state = AddressState::Failed(format!("{}: {}", what, err));
        false
    }

    /// Advances the state machine by one step.
    ///
    /// Returns `true` while there is more work, `false` once Done or Failed.
    pub fn step(&mut self, stages: &mut dyn Stages) -> bool {
        let job = self.job;
        match &self.state {
            AddressState::NotStarted => {
                if job.project_path.exists() {
                    tracing::info!(
                        "{} already processed ({}), skipping",
                        job.address,
                        job.project_path.display()
                    );
                    self.skipped = true;
                    self.state = AddressState::Done;
                    return false;
                }
                self.state = AddressState::CaptureChecked;
                true
            }

            AddressState::CaptureChecked => {
                let reuse = self.policy.reuse_existing
                    && self.retries_used == 0
                    && stages.capture_is_valid(job);
                if reuse {
                    tracing::info!("Reusing capture {}", job.capture_path.display());
                } else if let Err(e) = stages.capture(job) {
                    return self.fail("Capture failed", format!("{:#}", e));
                }
                self.state = AddressState::CaptureDone;
                true
            }

            AddressState::CaptureDone => {
                if !stages.capture_is_valid(job) {
                    if self.retries_used < self.policy.retries {
                        self.retries_used += 1;
                        tracing::warn!(
                            "Capture {} missing or too small, retrying ({}/{})",
                            job.capture_path.display(),
                            self.retries_used,
                            self.policy.retries
                        );
                        if let Err(e) = stages.reset() {
                            tracing::warn!("Failed to reset helpers before retry: {:#}", e);
                        }
                        self.state = AddressState::CaptureChecked;
                        return true;
                    }
                    return self.fail(
                        "Capture invalid",
                        format!("{} missing or too small", job.capture_path.display()),
                    );
                }
                match stages.open_blender(job) {
                    Ok(()) => {
                        self.state = AddressState::BlenderOpened;
                        true
                    }
                    Err(e) => self.fail("Blender stage failed", format!("{:#}", e)),
                }
            }

            AddressState::BlenderOpened => match stages.match_and_crop(job) {
                Ok(region) => {
                    tracing::info!(
                        "Crop region x={} y={} {}x{}",
                        region.x,
                        region.y,
                        region.width,
                        region.height
                    );
                    self.state = AddressState::MatchedAndCropped;
                    true
                }
                Err(e) => self.fail("Template matching failed", format!("{:#}", e)),
            },

            AddressState::MatchedAndCropped => match stages.wait_saved(job) {
                Ok(()) => {
                    self.state = AddressState::SaveSignalReceived;
                    true
                }
                Err(e) => self.fail("Save failed", format!("{:#}", e)),
            },

            AddressState::SaveSignalReceived => {
                self.state = AddressState::Done;
                false
            }

            AddressState::Done | AddressState::Failed(_) => false,
        }
    }

    /// Runs to completion and reports the outcome.
    pub fn run(mut self, stages: &mut dyn Stages) -> AddressOutcome {
        while self.step(stages) {
            tracing::debug!("{}: {}", self.job.filename, self.state);
        }
        let outcome = match &self.state {
            AddressState::Done if self.skipped => AddressOutcome::Skipped,
            AddressState::Done => AddressOutcome::Succeeded,
            AddressState::Failed(msg) => AddressOutcome::Failed(msg.clone()),
            other => AddressOutcome::Failed(format!("stopped in state {}", other)),
        };
        tracing::info!(
            "{} finished as {} in {:.1}s",
            self.job.address,
            outcome.status(),
            self.started.elapsed().as_secs_f32()
        );
        outcome
    }
}

/// Processes one job with helper cleanup before and after.
pub fn process_job(job: &Job, stages: &mut dyn Stages, policy: CapturePolicy) -> AddressOutcome {
    if let Some(reason) = &job.rejected {
        tracing::error!("{}: {}", job.address, reason);
        return AddressOutcome::Failed(reason.clone());
    }
    if let Err(e) = stages.reset() {
        tracing::warn!("Failed to clear helper processes: {:#}", e);
    }
    let outcome = AddressContext::new(job, policy).run(stages);
    if outcome != AddressOutcome::Skipped {
        if let Err(e) = stages.reset() {
            tracing::warn!("Failed to clear helper processes: {:#}", e);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// Scripted stages: `valid_after` captures before the file counts as valid.
    #[derive(Default)]
    struct FakeStages {
        calls: Vec<&'static str>,
        captures: u32,
        valid_after: Option<u32>,
        existing_capture: bool,
        fail_match: bool,
    }

    impl Stages for FakeStages {
        fn capture(&mut self, _job: &Job) -> Result<()> {
            self.calls.push("capture");
            self.captures += 1;
            Ok(())
        }

        fn capture_is_valid(&self, _job: &Job) -> bool {
            self.existing_capture || self.valid_after.is_some_and(|n| self.captures >= n)
        }

        fn open_blender(&mut self, _job: &Job) -> Result<()> {
            self.calls.push("blender");
            Ok(())
        }

        fn match_and_crop(&mut self, _job: &Job) -> Result<CropRegion> {
            self.calls.push("match");
            if self.fail_match {
                return Err(anyhow!("too few matches"));
            }
            Ok(CropRegion {
                x: 1,
                y: 2,
                width: 3,
                height: 4,
            })
        }

        fn wait_saved(&mut self, _job: &Job) -> Result<()> {
            self.calls.push("save");
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.calls.push("reset");
            Ok(())
        }
    }

    fn job(project_path: PathBuf) -> Job {
        Job {
            district: "default".to_string(),
            index: 1,
            address: "1 Main St".to_string(),
            filename: "1_Main_St".to_string(),
            capture_path: PathBuf::from("1_Main_St.rdc"),
            project_path,
            template_path: None,
            rejected: None,
        }
    }

    fn policy(retries: u32) -> CapturePolicy {
        CapturePolicy {
            retries,
            reuse_existing: false,
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", AddressState::NotStarted), "Not started");
        assert_eq!(
            format!("{}", AddressState::Failed("timeout".to_string())),
            "Failed: timeout"
        );
    }

    #[test]
    fn test_happy_path_visits_every_stage() {
        let dir = tempdir().unwrap();
        let job = job(dir.path().join("out.blend"));
        let mut stages = FakeStages {
            valid_after: Some(1),
            ..Default::default()
        };

        let mut ctx = AddressContext::new(&job, policy(1));
        let mut visited = vec![ctx.state.clone()];
        while ctx.step(&mut stages) {
            visited.push(ctx.state.clone());
        }
        visited.push(ctx.state.clone());

        assert_eq!(
            visited,
            vec![
                AddressState::NotStarted,
                AddressState::CaptureChecked,
                AddressState::CaptureDone,
                AddressState::BlenderOpened,
                AddressState::MatchedAndCropped,
                AddressState::SaveSignalReceived,
                AddressState::Done,
            ]
        );
        assert_eq!(stages.calls, vec!["capture", "blender", "match", "save"]);
    }

    #[test]
    fn test_existing_project_is_skipped() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("out.blend");
        std::fs::write(&project, b"blend").unwrap();
        let job = job(project);
        let mut stages = FakeStages::default();

        let outcome = process_job(&job, &mut stages, policy(1));
        assert_eq!(outcome, AddressOutcome::Skipped);
        // Only the cleanup before the address runs
        assert_eq!(stages.calls, vec!["reset"]);
    }

    #[test]
    fn test_rejected_job_fails_without_touching_stages() {
        let dir = tempdir().unwrap();
        // A rejected job's paths collapse to a shared name; it must not count as done
        let project = dir.path().join(".blend");
        std::fs::write(&project, b"blend").unwrap();
        let mut job = job(project);
        job.rejected = Some("no usable file name".to_string());
        let mut stages = FakeStages::default();

        let outcome = process_job(&job, &mut stages, policy(1));
        assert_eq!(
            outcome,
            AddressOutcome::Failed("no usable file name".to_string())
        );
        assert!(stages.calls.is_empty());
    }

    #[test]
    fn test_invalid_capture_retries_once_then_succeeds() {
        let dir = tempdir().unwrap();
        let job = job(dir.path().join("out.blend"));
        let mut stages = FakeStages {
            valid_after: Some(2),
            ..Default::default()
        };

        let outcome = AddressContext::new(&job, policy(1)).run(&mut stages);
        assert_eq!(outcome, AddressOutcome::Succeeded);
        assert_eq!(stages.captures, 2);
    }

    #[test]
    fn test_invalid_capture_fails_after_retry() {
        let dir = tempdir().unwrap();
        let job = job(dir.path().join("out.blend"));
        let mut stages = FakeStages::default();

        let outcome = AddressContext::new(&job, policy(1)).run(&mut stages);
        assert_eq!(stages.captures, 2);
        match outcome {
            AddressOutcome::Failed(msg) => assert!(msg.starts_with("Capture invalid")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!stages.calls.contains(&"blender"));
    }

    #[test]
    fn test_reuse_existing_capture() {
        let dir = tempdir().unwrap();
        let job = job(dir.path().join("out.blend"));
        let mut stages = FakeStages {
            existing_capture: true,
            ..Default::default()
        };
        let policy = CapturePolicy {
            retries: 1,
            reuse_existing: true,
        };

        let outcome = AddressContext::new(&job, policy).run(&mut stages);
        assert_eq!(outcome, AddressOutcome::Succeeded);
        assert_eq!(stages.captures, 0);
    }

    #[test]
    fn test_stage_error_fails_and_cleans_up() {
        let dir = tempdir().unwrap();
        let job = job(dir.path().join("out.blend"));
        let mut stages = FakeStages {
            valid_after: Some(1),
            fail_match: true,
            ..Default::default()
        };

        let outcome = process_job(&job, &mut stages, policy(1));
        assert_eq!(
            outcome,
            AddressOutcome::Failed("Template matching failed: too few matches".to_string())
        );
        assert_eq!(outcome.status(), "failed");
        assert_eq!(
            stages.calls,
            vec!["reset", "capture", "blender", "match", "reset"]
        );
    }
}
