//! Helper process lifecycle: launching and terminating the browser, RenderDoc and Blender.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Child, Command};

/// A process name to terminate between addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTarget {
    pub name: String,
    /// Substring match instead of exact match
    pub partial: bool,
}

impl ProcessTarget {
    pub fn exact(name: &str) -> Self {
        Self {
            name: name.to_string(),
            partial: false,
        }
    }

    pub fn partial(name: &str) -> Self {
        Self {
            name: name.to_string(),
            partial: true,
        }
    }

    /// Case-insensitive comparison against an executable name.
    pub fn matches(&self, process_name: &str) -> bool {
        let process_name = process_name.to_lowercase();
        let name = self.name.to_lowercase();
        if self.partial {
            process_name.contains(&name)
        } else {
            process_name == name
        }
    }
}

/// Browser, capture tool and 3D application.
pub fn helper_targets() -> Vec<ProcessTarget> {
    vec![
        ProcessTarget::exact("chrome.exe"),
        ProcessTarget::partial("renderdoc"),
        ProcessTarget::partial("blender"),
    ]
}

/// Fails when a configured executable does not exist.
pub fn ensure_executable(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(anyhow!("{} not found: {}", what, path.display()))
    }
}

/// Command starting `path` elevated through PowerShell (UAC prompt unless already elevated).
pub fn elevated_command(path: &Path) -> Command {
    let mut cmd = Command::new("powershell.exe");
    cmd.arg("-Command").arg(format!(
        "Start-Process -FilePath \"{}\" -Verb RunAs",
        path.display()
    ));
    cmd
}

pub fn spawn(mut cmd: Command, what: &str) -> Result<Child> {
    tracing::debug!("Launching {}: {:?}", what, cmd);
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to launch {}", what))?;
    tracing::info!("Launched {} (pid {})", what, child.id());
    Ok(child)
}

/// Terminates processes whose executable name matches one of `targets`.
#[cfg(windows)]
pub fn terminate_matching(targets: &[ProcessTarget]) -> Result<usize> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    let own_pid = std::process::id();
    let mut terminated = 0;

    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)?;
        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        let mut has_entry = Process32FirstW(snapshot, &mut entry).is_ok();
        while has_entry {
            let len = entry
                .szExeFile
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(entry.szExeFile.len());
            let name = OsString::from_wide(&entry.szExeFile[..len])
                .to_string_lossy()
                .to_string();
            let pid = entry.th32ProcessID;

            if pid != own_pid && targets.iter().any(|t| t.matches(&name)) {
                match OpenProcess(PROCESS_TERMINATE, false, pid) {
                    Ok(handle) => {
                        match TerminateProcess(handle, 1) {
                            Ok(()) => {
                                tracing::debug!("Terminated {} (pid {})", name, pid);
                                terminated += 1;
                            }
                            Err(e) => tracing::warn!("Failed to terminate {} ({}): {}", name, pid, e),
                        }
                        let _ = CloseHandle(handle);
                    }
                    Err(e) => tracing::warn!("Cannot open {} ({}): {}", name, pid, e),
                }
            }

            has_entry = Process32NextW(snapshot, &mut entry).is_ok();
        }
        let _ = CloseHandle(snapshot);
    }

    Ok(terminated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_partial_matching() {
        let chrome = ProcessTarget::exact("chrome.exe");
        assert!(chrome.matches("chrome.exe"));
        assert!(chrome.matches("Chrome.EXE"));
        assert!(!chrome.matches("chrome_proxy.exe"));

        let renderdoc = ProcessTarget::partial("renderdoc");
        assert!(renderdoc.matches("qrenderdoc.exe"));
        assert!(renderdoc.matches("RenderDocCmd.exe"));
        assert!(!renderdoc.matches("blender.exe"));
    }

    #[test]
    fn test_helper_targets() {
        let targets = helper_targets();
        assert!(targets.iter().any(|t| t.matches("chrome.exe")));
        assert!(targets.iter().any(|t| t.matches("qrenderdoc.exe")));
        assert!(targets.iter().any(|t| t.matches("Blender.exe")));
        assert!(!targets.iter().any(|t| t.matches("streetmesh.exe")));
    }

    #[test]
    fn test_elevated_command() {
        let cmd = elevated_command(Path::new(r"C:\Tools\RenderDoc\qrenderdoc.exe"));
        assert_eq!(cmd.get_program(), "powershell.exe");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "-Command".to_string(),
                r#"Start-Process -FilePath "C:\Tools\RenderDoc\qrenderdoc.exe" -Verb RunAs"#
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_ensure_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tool.exe");
        assert!(ensure_executable(&exe, "Tool").is_err());
        std::fs::write(&exe, b"").unwrap();
        assert!(ensure_executable(&exe, "Tool").is_ok());
    }
}
