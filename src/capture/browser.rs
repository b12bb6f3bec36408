//! Satellite map in the browser, started so RenderDoc can hook its GPU process.

use anyhow::Result;
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

use crate::automation::process::{ensure_executable, spawn};
use crate::automation::Desktop;
use crate::geocode::LatLng;

pub fn map_url(location: LatLng, zoom: u32) -> String {
    format!(
        "https://www.google.com/maps/@{},{},{}z/data=!3m1!1e3",
        location.lat, location.lng, zoom
    )
}

/// The GPU-startup dialog pauses the GPU process until it is confirmed,
/// which leaves time to inject RenderDoc.
pub fn browser_command(chrome_path: &Path, url: &str) -> Command {
    let mut cmd = Command::new(chrome_path);
    cmd.args([
        "--disable-gpu-sandbox",
        "--gpu-startup-dialog",
        "--disable_direct_composition=1",
        url,
    ])
    .env("RENDERDOC_HOOK_EGL", "0");
    cmd
}

/// Opens the map and waits `settle` for the window to appear.
pub fn launch_browser(
    desktop: &dyn Desktop,
    chrome_path: &Path,
    location: LatLng,
    zoom: u32,
    settle: Duration,
) -> Result<Child> {
    ensure_executable(chrome_path, "Browser")?;
    let url = map_url(location, zoom);
    tracing::info!("Opening {}", url);
    let child = spawn(browser_command(chrome_path, &url), "browser")?;
    desktop.sleep(settle);
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_map_url() {
        let location = LatLng {
            lat: 33.9617,
            lng: -118.3531,
        };
        assert_eq!(
            map_url(location, 21),
            "https://www.google.com/maps/@33.9617,-118.3531,21z/data=!3m1!1e3"
        );
    }

    #[test]
    fn test_browser_command() {
        let cmd = browser_command(
            Path::new(r"C:\Chrome\chrome.exe"),
            "https://www.google.com/maps/@1,2,21z/data=!3m1!1e3",
        );
        assert_eq!(cmd.get_program(), OsStr::new(r"C:\Chrome\chrome.exe"));
        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(
            args,
            vec![
                OsStr::new("--disable-gpu-sandbox"),
                OsStr::new("--gpu-startup-dialog"),
                OsStr::new("--disable_direct_composition=1"),
                OsStr::new("https://www.google.com/maps/@1,2,21z/data=!3m1!1e3"),
            ]
        );
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(
            envs,
            vec![(OsStr::new("RENDERDOC_HOOK_EGL"), Some(OsStr::new("0")))]
        );
    }

    #[test]
    fn test_launch_requires_executable() {
        let desktop = crate::automation::fake::FakeDesktop::default();
        let dir = tempfile::tempdir().unwrap();
        let err = launch_browser(
            &desktop,
            &dir.path().join("chrome.exe"),
            LatLng { lat: 0.0, lng: 0.0 },
            21,
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Browser not found"));
    }
}
