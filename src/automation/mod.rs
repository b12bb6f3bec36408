//! Desktop automation and the per-address pipeline.
//!
//! This module provides:
//! - The `Desktop` seam for window lookup, synthetic input, capture and process control
//! - Pipeline configuration read from the settings store
//! - The per-address state machine and the run loop
//! - CSV run reports

pub mod config;
pub mod desktop;
#[cfg(windows)]
pub mod input;
pub mod process;
pub mod report;
pub mod runner;
pub mod state;
pub mod wait;

use anyhow::{anyhow, Result};
use image::RgbaImage;
use std::time::Duration;

pub use config::PipelineConfig;
pub use desktop::default_desktop;
pub use process::ProcessTarget;
pub use runner::{run_pipeline, RunSummary};
pub use state::{AddressOutcome, AddressState};

/// Window rectangle in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenRect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl ScreenRect {
    /// A `width` x `height` rectangle centred on a screen, kept on-screen.
    pub fn centered(screen: (i32, i32), width: i32, height: i32) -> Self {
        Self {
            left: ((screen.0 - width) / 2).max(0),
            top: ((screen.1 - height) / 2).max(0),
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowInfo {
    /// Native handle (HWND on Windows)
    pub handle: isize,
    pub title: String,
    pub rect: ScreenRect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Delete,
    Shift,
    Alt,
    Control,
    F12,
    /// A letter or digit key
    Char(char),
}

/// Everything the pipeline needs from the desktop session.
///
/// Coordinates are absolute screen pixels.
pub trait Desktop {
    fn screen_size(&self) -> Result<(i32, i32)>;

    /// First visible window whose title contains `fragment` (case-insensitive).
    fn find_window(&self, fragment: &str) -> Result<Option<WindowInfo>>;

    fn activate_window(&self, window: &WindowInfo) -> Result<()>;

    fn place_window(&self, window: &WindowInfo, rect: ScreenRect) -> Result<()>;

    fn move_mouse(&self, x: i32, y: i32) -> Result<()>;

    fn mouse_button(&self, button: MouseButton, down: bool) -> Result<()>;

    fn key(&self, key: Key, down: bool) -> Result<()>;

    /// Types `text` one character at a time.
    fn type_text(&self, text: &str, interval: Duration) -> Result<()>;

    /// Client area of `window` as an image.
    fn capture_window(&self, window: &WindowInfo) -> Result<RgbaImage>;

    /// Terminates every process matching one of `targets`. Returns how many were stopped.
    fn terminate_processes(&self, targets: &[ProcessTarget]) -> Result<usize>;

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn click(&self, x: i32, y: i32, button: MouseButton) -> Result<()> {
        self.move_mouse(x, y)?;
        self.sleep(Duration::from_millis(50));
        self.mouse_button(button, true)?;
        self.sleep(Duration::from_millis(50));
        self.mouse_button(button, false)
    }

    fn press(&self, key: Key) -> Result<()> {
        self.key(key, true)?;
        self.key(key, false)
    }

    fn hotkey(&self, modifier: Key, key: Key) -> Result<()> {
        self.key(modifier, true)?;
        self.press(key)?;
        self.key(modifier, false)
    }

    /// Moves the cursor in a straight line over `duration`.
    fn glide(&self, from: (i32, i32), to: (i32, i32), duration: Duration) -> Result<()> {
        const STEP: Duration = Duration::from_millis(20);
        let steps = (duration.as_millis() / STEP.as_millis()).max(1) as i32;
        for i in 1..=steps {
            let x = from.0 + (to.0 - from.0) * i / steps;
            let y = from.1 + (to.1 - from.1) * i / steps;
            self.move_mouse(x, y)?;
            self.sleep(STEP);
        }
        Ok(())
    }

    fn activate_by_title(&self, fragment: &str) -> Result<WindowInfo> {
        let window = self
            .find_window(fragment)?
            .ok_or_else(|| anyhow!("No window titled \"{}\"", fragment))?;
        self.activate_window(&window)?;
        Ok(window)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{Action, FakeDesktop};
    use super::*;

    #[test]
    fn test_centered_rect() {
        assert_eq!(
            ScreenRect::centered((2560, 1440), 1600, 900),
            ScreenRect {
                left: 480,
                top: 270,
                width: 1600,
                height: 900
            }
        );
        assert_eq!(ScreenRect::centered((1280, 720), 1600, 900).left, 0);
    }

    #[test]
    fn test_click_sequence() {
        let desktop = FakeDesktop::default();
        desktop.click(10, 20, MouseButton::Right).unwrap();
        assert_eq!(
            desktop.actions(),
            vec![
                Action::Move(10, 20),
                Action::Button(MouseButton::Right, true),
                Action::Button(MouseButton::Right, false),
            ]
        );
    }

    #[test]
    fn test_hotkey_releases_modifier_last() {
        let desktop = FakeDesktop::default();
        desktop.hotkey(Key::Alt, Key::Char('f')).unwrap();
        assert_eq!(
            desktop.actions(),
            vec![
                Action::Key(Key::Alt, true),
                Action::Key(Key::Char('f'), true),
                Action::Key(Key::Char('f'), false),
                Action::Key(Key::Alt, false),
            ]
        );
    }

    #[test]
    fn test_glide_ends_at_target() {
        let desktop = FakeDesktop::default();
        desktop
            .glide((0, 0), (200, -100), Duration::from_millis(300))
            .unwrap();
        let actions = desktop.actions();
        assert_eq!(actions.len(), 15);
        assert_eq!(actions.last(), Some(&Action::Move(200, -100)));
    }

    #[test]
    fn test_activate_by_title_is_case_insensitive() {
        let desktop = FakeDesktop::with_windows(&["Map - Google Chrome", "RenderDoc v1.31"]);
        let window = desktop.activate_by_title("renderdoc").unwrap();
        assert_eq!(window.title, "RenderDoc v1.31");
        assert!(desktop.activate_by_title("Blender").is_err());
    }
}
