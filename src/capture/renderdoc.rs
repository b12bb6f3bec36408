//! RenderDoc injection and frame capture, driven through synthetic input.
//!
//! RenderDoc has no scripting hook for "Inject into Process", so both
//! sequences replay the UI by keyboard and by fixed coordinates from the
//! `layout` settings section.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Child;
use std::time::Duration;

use crate::automation::config::PipelineConfig;
use crate::automation::process::{elevated_command, ensure_executable, spawn};
use crate::automation::wait::wait_for_window;
use crate::automation::{Desktop, Key, MouseButton, ScreenRect, WindowInfo};

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

/// Starts RenderDoc elevated. Injection needs the same integrity level as the browser's GPU process.
pub fn launch_renderdoc(desktop: &dyn Desktop, renderdoc_path: &Path) -> Result<Child> {
    ensure_executable(renderdoc_path, "RenderDoc")?;
    let child = spawn(elevated_command(renderdoc_path), "RenderDoc")?;
    desktop.sleep(secs(3.0));
    Ok(child)
}

/// Attaches to RenderDoc and injects it into the browser's paused GPU process.
///
/// Returns the RenderDoc window as placed on screen.
pub fn inject(desktop: &dyn Desktop, config: &PipelineConfig) -> Result<WindowInfo> {
    let layout = &config.capture;
    let mut window = wait_for_window(
        desktop,
        &config.windows.renderdoc,
        config.window_retries,
        config.window_retry_delay,
    )?;

    let (width, height) = layout.renderdoc_size;
    let rect = ScreenRect::centered(desktop.screen_size()?, width, height);
    desktop.place_window(&window, rect)?;
    window.rect = rect;
    desktop.activate_window(&window)?;
    desktop.sleep(secs(2.0));

    // File > Inject into Process
    desktop.hotkey(Key::Alt, Key::Char('f'))?;
    desktop.sleep(secs(2.0));
    desktop.press(Key::Char('i'))?;
    desktop.sleep(secs(1.0));
    desktop.press(Key::Enter)?;
    desktop.sleep(secs(1.0));

    let (x, y) = layout.process_list;
    desktop.click(rect.left + x, rect.top + y, MouseButton::Left)?;
    desktop.sleep(secs(0.5));
    desktop.type_text(&layout.search_text, layout.typing_interval)?;
    desktop.sleep(secs(1.0));

    let (x, y) = layout.first_result;
    desktop.click(rect.left + x, rect.top + y, MouseButton::Left)?;
    desktop.sleep(secs(0.5));
    desktop.press(Key::Enter)?;
    desktop.sleep(secs(1.0));

    // Let the GPU process continue now that RenderDoc is attached
    desktop
        .activate_by_title(&config.windows.browser_gpu)
        .context("Browser GPU dialog not found")?;
    desktop.sleep(secs(1.0));
    desktop.press(Key::Enter)?;
    desktop.sleep(secs(1.0));

    tracing::info!("Injected RenderDoc into the browser GPU process");
    Ok(window)
}

/// Drags the map to force fresh frames, captures one with F12 and saves it to `capture_path`.
///
/// Returns once the save is submitted; RenderDoc writes the file asynchronously.
pub fn capture_frame(desktop: &dyn Desktop, config: &PipelineConfig, capture_path: &Path) -> Result<()> {
    let layout = &config.capture;
    if capture_path.exists() {
        std::fs::remove_file(capture_path)
            .with_context(|| format!("Failed to remove old capture {}", capture_path.display()))?;
    }

    desktop
        .activate_by_title(&config.windows.browser)
        .context("Browser window not found")?;
    desktop.sleep(secs(1.0));

    let (screen_w, screen_h) = desktop.screen_size()?;
    let center = (screen_w / 2, screen_h / 2);
    desktop.glide(center, center, secs(0.5))?;

    // Left, right, up, down, back to the centre after each
    let d = layout.drag_distance;
    desktop.mouse_button(MouseButton::Left, true)?;
    desktop.sleep(secs(0.5));
    for _ in 0..2 {
        for (dx, dy) in [(-d, 0), (d, 0), (0, -d), (0, d)] {
            let target = (center.0 + dx, center.1 + dy);
            desktop.glide(center, target, layout.stroke)?;
            desktop.glide(target, center, layout.stroke)?;
        }
    }
    desktop.press(Key::F12)?;
    desktop.sleep(secs(1.0));
    desktop.mouse_button(MouseButton::Left, false)?;
    desktop.sleep(secs(0.5));

    desktop
        .activate_by_title(&config.windows.renderdoc)
        .context("RenderDoc window not found")?;
    desktop.sleep(secs(1.0));

    // Thumbnail context menu > Save
    let thumbnail = layout.thumbnail;
    desktop.glide(center, thumbnail, secs(0.5))?;
    desktop.click(thumbnail.0, thumbnail.1, MouseButton::Left)?;
    desktop.click(thumbnail.0, thumbnail.1, MouseButton::Right)?;
    desktop.sleep(secs(0.3));
    let save = layout.save_menu;
    desktop.glide(thumbnail, save, secs(0.3))?;
    desktop.click(save.0, save.1, MouseButton::Left)?;
    desktop.sleep(secs(3.0));

    // Replace whatever the file dialog suggests with the full target path
    desktop.hotkey(Key::Control, Key::Char('a'))?;
    desktop.press(Key::Delete)?;
    desktop.sleep(secs(0.3));
    desktop.press(Key::Shift)?;
    desktop.sleep(secs(0.5));
    desktop.type_text(&capture_path.display().to_string(), layout.typing_interval)?;
    desktop.sleep(secs(0.5));
    desktop.press(Key::Enter)?;

    tracing::info!("Requested capture save to {}", capture_path.display());
    Ok(())
}
