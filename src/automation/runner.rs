//! Pipeline runner - processes every job in order.
//!
//! Wires the live stages (geocoder, desktop, browser, RenderDoc, Blender,
//! template matching) into the per-address state machine and records each
//! outcome in the run report.

use anyhow::{anyhow, Context, Result};
use std::process::Child;
use std::time::{Duration, Instant};

use crate::address::Job;
use crate::automation::config::{PipelineConfig, SignalTransport};
use crate::automation::process::helper_targets;
use crate::automation::report::RunReport;
use crate::automation::state::{process_job, AddressOutcome, CapturePolicy, Stages};
use crate::automation::wait::{capture_is_valid, wait_for_capture, wait_for_window};
use crate::automation::Desktop;
use crate::blender;
use crate::capture::browser::launch_browser;
use crate::capture::renderdoc::{capture_frame, inject, launch_renderdoc};
use crate::geocode::{Geocoder, LatLng};
use crate::matching::{load_image, match_template, write_artifacts, CropRegion};
use crate::signal::{FileSignals, SignalChannel, TcpSignals};

/// Counts per outcome, plus the failures with their reasons.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

impl RunSummary {
    pub fn record(&mut self, job: &Job, outcome: &AddressOutcome) {
        match outcome {
            AddressOutcome::Succeeded => self.succeeded += 1,
            AddressOutcome::Skipped => self.skipped += 1,
            AddressOutcome::Failed(msg) => self.failed.push((job.address.clone(), msg.clone())),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed.len()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} addresses: {} succeeded, {} skipped, {} failed",
            self.total(),
            self.succeeded,
            self.skipped,
            self.failed.len()
        )
    }
}

pub fn open_signals(config: &PipelineConfig) -> Result<Box<dyn SignalChannel>> {
    Ok(match config.signals.transport {
        SignalTransport::File => Box::new(
            FileSignals::new(&config.signal_dir, config.signals.poll_interval)
                .context("Failed to open signal directory")?,
        ),
        SignalTransport::Tcp => {
            let signals = TcpSignals::bind(config.signals.port)
                .context("Failed to bind signal socket")?;
            tracing::info!("Listening for Blender on 127.0.0.1:{}", signals.port());
            Box::new(signals)
        }
    })
}

/// The real stage implementations.
pub struct LiveStages<'a> {
    config: &'a PipelineConfig,
    geocoder: &'a dyn Geocoder,
    desktop: &'a dyn Desktop,
    signals: Box<dyn SignalChannel>,
    children: Vec<Child>,
    /// Last geocoded address, reused when a capture is retried
    located: Option<(String, LatLng)>,
}

impl<'a> LiveStages<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        geocoder: &'a dyn Geocoder,
        desktop: &'a dyn Desktop,
        signals: Box<dyn SignalChannel>,
    ) -> Self {
        Self {
            config,
            geocoder,
            desktop,
            signals,
            children: Vec::new(),
            located: None,
        }
    }

    fn locate(&mut self, address: &str) -> Result<LatLng> {
        if let Some((cached, location)) = &self.located {
            if cached == address {
                return Ok(*location);
            }
        }
        let location = self
            .geocoder
            .geocode(address)
            .with_context(|| format!("Geocoding \"{}\" failed", address))?;
        tracing::info!("{} -> {}", address, location);
        self.located = Some((address.to_string(), location));
        Ok(location)
    }
}

impl Stages for LiveStages<'_> {
    fn capture(&mut self, job: &Job) -> Result<()> {
        let config = self.config;
        let location = self.locate(&job.address)?;

        let browser = launch_browser(
            self.desktop,
            &config.chrome_path,
            location,
            config.map_zoom,
            config.browser_settle,
        )?;
        self.children.push(browser);

        let renderdoc = launch_renderdoc(self.desktop, &config.renderdoc_path)?;
        self.children.push(renderdoc);
        inject(self.desktop, config)?;
        capture_frame(self.desktop, config, &job.capture_path)?;

        if !wait_for_capture(
            self.desktop,
            &job.capture_path,
            config.min_capture_kb,
            config.capture_save_timeout,
        )? {
            tracing::warn!(
                "No valid capture at {} after {}s",
                job.capture_path.display(),
                config.capture_save_timeout.as_secs()
            );
        }
        Ok(())
    }

    fn capture_is_valid(&self, job: &Job) -> bool {
        capture_is_valid(&job.capture_path, self.config.min_capture_kb)
    }

    fn open_blender(&mut self, job: &Job) -> Result<()> {
        let config = self.config;
        let child = blender::launch(
            &config.blender_path,
            &config.signal_dir,
            &job.capture_path,
            &job.project_path,
            &config.cleanup,
            self.signals.as_mut(),
        )?;
        self.children.push(child);
        blender::wait_for_scene(
            self.signals.as_mut(),
            config.blender_timeout,
            config.signals.timeout,
        )?;
        Ok(())
    }

    fn match_and_crop(&mut self, job: &Job) -> Result<CropRegion> {
        let config = self.config;
        let template_path = job.template_path.as_ref().ok_or_else(|| {
            anyhow!(
                "No template for district \"{}\" position {}",
                job.district,
                job.index
            )
        })?;

        let window = wait_for_window(
            self.desktop,
            &config.windows.blender,
            config.window_retries,
            config.window_retry_delay,
        )?;
        self.desktop.activate_window(&window)?;
        self.desktop.sleep(Duration::from_secs(1));
        let screenshot = self.desktop.capture_window(&window)?;

        let template = load_image(template_path)?.to_rgba8();
        let result = match_template(
            &image::imageops::grayscale(&template),
            &image::imageops::grayscale(&screenshot),
            &config.matching,
        )?;
        tracing::info!(
            "Template {} matched ({} good, {} inliers, centre {:?})",
            template_path.display(),
            result.good_matches,
            result.inliers,
            result.center
        );

        let out_dir = config.screenshot_dir.join(&job.district);
        match write_artifacts(
            &out_dir,
            &job.filename,
            template_path,
            &template,
            &screenshot,
            &result,
        ) {
            Ok(artifacts) => tracing::debug!("Match artifacts in {}", artifacts.report.display()),
            Err(e) => tracing::warn!("Failed to write match artifacts: {:#}", e),
        }

        blender::send_crop(self.signals.as_mut(), result.region)?;
        Ok(result.region)
    }

    fn wait_saved(&mut self, job: &Job) -> Result<()> {
        blender::wait_for_save(
            self.signals.as_mut(),
            &job.project_path,
            self.config.save_timeout,
        )
    }

    fn reset(&mut self) -> Result<()> {
        let stopped = self.desktop.terminate_processes(&helper_targets())?;
        for mut child in self.children.drain(..) {
            // Reap what terminate_processes stopped; elevated launchers may already be gone
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if stopped > 0 {
            tracing::debug!("Stopped {} helper processes", stopped);
            self.desktop.sleep(Duration::from_secs(1));
        }
        Ok(())
    }
}

/// Runs every job in order, recording each outcome in `report`.
///
/// A failed address never stops the run.
pub fn run_pipeline(
    config: &PipelineConfig,
    jobs: &[Job],
    stages: &mut dyn Stages,
    report: Option<&RunReport>,
) -> RunSummary {
    let policy = CapturePolicy {
        retries: config.capture_retries,
        reuse_existing: config.reuse_capture,
    };
    let mut summary = RunSummary::default();

    tracing::info!("Processing {} addresses", jobs.len());
    for (i, job) in jobs.iter().enumerate() {
        tracing::info!(
            "[{}/{}] {} #{}: {}",
            i + 1,
            jobs.len(),
            job.district,
            job.index,
            job.address
        );
        let started = Instant::now();
        let outcome = process_job(job, stages, policy);
        if let AddressOutcome::Failed(msg) = &outcome {
            tracing::error!("{} failed: {}", job.address, msg);
        }
        if let Some(report) = report {
            if let Err(e) = report.append(job, &outcome, started.elapsed()) {
                tracing::warn!("Failed to record outcome: {:#}", e);
            }
        }
        summary.record(job, &outcome);
    }

    tracing::info!("{}", summary);
    summary
}
