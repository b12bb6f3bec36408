use std::path::PathBuf;
use std::sync::OnceLock;

static EXE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the directory containing the executable.
pub fn get_exe_dir() -> &'static PathBuf {
    EXE_DIR.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

/// Returns the default settings file: `<exe_dir>/config.json`
pub fn get_default_config_path() -> PathBuf {
    get_exe_dir().join("config.json")
}

/// Returns the logs directory: `<exe_dir>/logs/`
pub fn get_logs_dir() -> PathBuf {
    get_exe_dir().join("logs")
}

/// Returns the screenshots directory: `<exe_dir>/screenshots/`
pub fn get_screenshots_dir() -> PathBuf {
    get_exe_dir().join("screenshots")
}

/// Returns the signal marker directory: `<exe_dir>/signals/`
pub fn get_signals_dir() -> PathBuf {
    get_exe_dir().join("signals")
}

/// Where RenderDoc saves captures when no `paths.rdc_dir` is configured.
pub fn get_default_capture_dir() -> PathBuf {
    dirs::document_dir().unwrap_or_else(|| get_exe_dir().clone())
}

/// Ensures all output directories exist. Call at startup.
pub fn ensure_directories(dirs: &[&PathBuf]) -> std::io::Result<()> {
    for dir in dirs {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
