//! Blender stage: the bundled script, its parameters and the signal handshake.
//!
//! The script is compiled into the binary and written next to its params file
//! at launch, so a run never depends on a script checked out elsewhere.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use crate::automation::process::{ensure_executable, spawn};
use crate::matching::CropRegion;
use crate::signal::{EventKind, SignalChannel, StageEvent, TransportParams};

pub const STAGE_SCRIPT: &str = include_str!("../resources/blender/stage.py");

/// Operator registered by the RenderDoc import add-on.
pub const IMPORTER: &str = "import_rdc.google_maps";

const SCRIPT_NAME: &str = "streetmesh_stage.py";
const PARAMS_NAME: &str = "streetmesh_params.json";

/// Mesh cleanup run by the script after the import. `None` leaves a step off.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshCleanup {
    /// Vertices closer than this are merged after joining the capture's meshes
    pub merge_distance: f64,
    /// Drop vertices farther than this from the mesh centre
    pub max_distance: Option<f64>,
    /// Drop vertices below this height unless an edge connects them upwards
    pub min_height: Option<f64>,
    /// Decimate modifier ratio, `(0, 1]`
    pub decimate_ratio: Option<f64>,
}

impl Default for MeshCleanup {
    fn default() -> Self {
        Self {
            merge_distance: 0.0001,
            max_distance: None,
            min_height: None,
            decimate_ratio: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageParams {
    pub capture_path: PathBuf,
    pub project_path: PathBuf,
    pub importer: String,
    pub transport: TransportParams,
    pub cleanup: MeshCleanup,
}

#[derive(Debug, Clone)]
pub struct StageFiles {
    pub script: PathBuf,
    pub params: PathBuf,
}

/// Writes the stage script and `params` into `dir`.
pub fn write_stage_files(dir: &Path, params: &StageParams) -> Result<StageFiles> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let files = StageFiles {
        script: dir.join(SCRIPT_NAME),
        params: dir.join(PARAMS_NAME),
    };
    fs::write(&files.script, STAGE_SCRIPT).context("Failed to write Blender stage script")?;
    let json = serde_json::to_string_pretty(params)?;
    fs::write(&files.params, json).context("Failed to write Blender stage params")?;
    Ok(files)
}

pub fn blender_command(blender_path: &Path, files: &StageFiles) -> Command {
    let mut cmd = Command::new(blender_path);
    cmd.arg("--python")
        .arg(&files.script)
        .arg("--")
        .arg(&files.params);
    cmd
}

/// Clears stale signals, writes the stage files and starts Blender.
pub fn launch(
    blender_path: &Path,
    work_dir: &Path,
    capture_path: &Path,
    project_path: &Path,
    cleanup: &MeshCleanup,
    signals: &mut dyn SignalChannel,
) -> Result<Child> {
    ensure_executable(blender_path, "Blender")?;
    if !capture_path.is_file() {
        return Err(anyhow!("Capture file missing: {}", capture_path.display()));
    }
    signals.clear().context("Failed to clear stale signals")?;

    let params = StageParams {
        capture_path: capture_path.to_path_buf(),
        project_path: project_path.to_path_buf(),
        importer: IMPORTER.to_string(),
        transport: signals.transport_params(),
        cleanup: cleanup.clone(),
    };
    let files = write_stage_files(work_dir, &params)?;
    spawn(blender_command(blender_path, &files), "Blender")
}

/// Waits for the script to start, then for the imported scene. Returns the vertex count when reported.
pub fn wait_for_scene(
    signals: &mut dyn SignalChannel,
    ready_timeout: Duration,
    export_timeout: Duration,
) -> Result<Option<u64>> {
    signals
        .wait_for(EventKind::ScriptReady, ready_timeout)
        .context("Blender stage script did not start")?;
    match signals
        .wait_for(EventKind::ExportDone, export_timeout)
        .context("Blender did not finish importing the capture")?
    {
        StageEvent::ExportDone { vertices } => {
            if let Some(count) = vertices {
                tracing::info!("Scene ready: {} vertices", count);
            }
            Ok(vertices)
        }
        other => Err(anyhow!("Unexpected {} event", other.kind())),
    }
}

pub fn send_crop(signals: &mut dyn SignalChannel, region: CropRegion) -> Result<()> {
    signals
        .send(&StageEvent::MatchDone { region })
        .context("Failed to send crop region")?;
    Ok(())
}

/// Waits for the save signal and checks the project file landed at `project_path`.
pub fn wait_for_save(
    signals: &mut dyn SignalChannel,
    project_path: &Path,
    timeout: Duration,
) -> Result<()> {
    let event = signals
        .wait_for(EventKind::SaveDone, timeout)
        .context("Blender did not save the project")?;
    if let StageEvent::SaveDone {
        project: Some(saved),
    } = &event
    {
        if saved != project_path {
            tracing::warn!(
                "Blender reported {} instead of {}",
                saved.display(),
                project_path.display()
            );
        }
    }
    if !project_path.is_file() {
        return Err(anyhow!(
            "Save signalled but {} does not exist",
            project_path.display()
        ));
    }
    tracing::info!("Saved {}", project_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::FileSignals;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    #[test]
    fn test_stage_files() {
        let dir = tempdir().unwrap();
        let params = StageParams {
            capture_path: PathBuf::from("C:/rdc/1_Main_St.rdc"),
            project_path: PathBuf::from("D:/projects/default/1_Main_St.blend"),
            importer: IMPORTER.to_string(),
            transport: TransportParams::Tcp {
                host: "127.0.0.1".to_string(),
                port: 5123,
            },
            cleanup: MeshCleanup {
                min_height: Some(0.5),
                ..MeshCleanup::default()
            },
        };
        let files = write_stage_files(dir.path(), &params).unwrap();

        let script = fs::read_to_string(&files.script).unwrap();
        assert!(script.contains("import bpy"));
        assert!(script.contains("remove_doubles"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&files.params).unwrap()).unwrap();
        assert_eq!(json["capture_path"], "C:/rdc/1_Main_St.rdc");
        assert_eq!(json["importer"], "import_rdc.google_maps");
        assert_eq!(json["transport"]["kind"], "tcp");
        assert_eq!(json["transport"]["port"], 5123);
        assert_eq!(json["cleanup"]["merge_distance"], 0.0001);
        assert_eq!(json["cleanup"]["min_height"], 0.5);
        assert!(json["cleanup"]["max_distance"].is_null());
        assert!(json["cleanup"]["decimate_ratio"].is_null());
    }

    #[test]
    fn test_blender_command() {
        let files = StageFiles {
            script: PathBuf::from("signals/streetmesh_stage.py"),
            params: PathBuf::from("signals/streetmesh_params.json"),
        };
        let cmd = blender_command(Path::new("blender.exe"), &files);
        assert_eq!(cmd.get_program(), OsStr::new("blender.exe"));
        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(
            args,
            vec![
                OsStr::new("--python"),
                OsStr::new("signals/streetmesh_stage.py"),
                OsStr::new("--"),
                OsStr::new("signals/streetmesh_params.json"),
            ]
        );
    }

    #[test]
    fn test_launch_requires_capture() {
        let dir = tempdir().unwrap();
        let blender = dir.path().join("blender.exe");
        fs::write(&blender, b"").unwrap();
        let mut signals = FileSignals::new(dir.path().join("signals"), Duration::ZERO).unwrap();
        let err = launch(
            &blender,
            dir.path(),
            &dir.path().join("missing.rdc"),
            &dir.path().join("out.blend"),
            &MeshCleanup::default(),
            &mut signals,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Capture file missing"));
    }

    #[test]
    fn test_handshake_over_file_signals() {
        let dir = tempdir().unwrap();
        let signal_dir = dir.path().join("signals");
        let mut driver = FileSignals::new(&signal_dir, Duration::from_millis(10)).unwrap();
        let mut script = FileSignals::new(&signal_dir, Duration::from_millis(10)).unwrap();

        script.send(&StageEvent::ScriptReady).unwrap();
        script
            .send(&StageEvent::ExportDone {
                vertices: Some(4096),
            })
            .unwrap();
        let vertices =
            wait_for_scene(&mut driver, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        assert_eq!(vertices, Some(4096));

        let region = CropRegion {
            x: 10,
            y: 20,
            width: 300,
            height: 200,
        };
        send_crop(&mut driver, region).unwrap();
        let received = script
            .wait_for(EventKind::MatchDone, Duration::from_secs(1))
            .unwrap();
        assert_eq!(received, StageEvent::MatchDone { region });

        let project = dir.path().join("out.blend");
        script
            .send(&StageEvent::SaveDone {
                project: Some(project.clone()),
            })
            .unwrap();
        // The signal alone is not enough without the file
        assert!(wait_for_save(&mut driver, &project, Duration::from_secs(1)).is_err());

        fs::write(&project, b"BLENDER").unwrap();
        script
            .send(&StageEvent::SaveDone {
                project: Some(project.clone()),
            })
            .unwrap();
        wait_for_save(&mut driver, &project, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_wait_for_scene_times_out() {
        let dir = tempdir().unwrap();
        let mut driver = FileSignals::new(dir.path(), Duration::from_millis(10)).unwrap();
        let err = wait_for_scene(&mut driver, Duration::from_millis(30), Duration::from_secs(1))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
    }
}
