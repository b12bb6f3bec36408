//! Platform implementations of the `Desktop` seam.

use anyhow::Result;
#[cfg(not(windows))]
use anyhow::anyhow;
use image::RgbaImage;
use std::time::Duration;

use super::{Desktop, Key, MouseButton, ProcessTarget, ScreenRect, WindowInfo};

/// Win32 desktop: EnumWindows lookup, SendInput, Graphics Capture and ToolHelp.
#[cfg(windows)]
pub struct WindowsDesktop;

#[cfg(windows)]
impl WindowsDesktop {
    pub fn new() -> Self {
        // Graphics Capture needs the WinRT apartment; an already-initialized thread is fine
        unsafe {
            let _ = windows::Win32::System::WinRT::RoInitialize(
                windows::Win32::System::WinRT::RO_INIT_MULTITHREADED,
            );
        }
        Self
    }
}

#[cfg(windows)]
impl Desktop for WindowsDesktop {
    fn screen_size(&self) -> Result<(i32, i32)> {
        Ok(super::input::screen_size())
    }

    fn find_window(&self, fragment: &str) -> Result<Option<WindowInfo>> {
        crate::capture::window::find_window_by_title(fragment)
    }

    fn activate_window(&self, window: &WindowInfo) -> Result<()> {
        crate::capture::window::activate(window)
    }

    fn place_window(&self, window: &WindowInfo, rect: ScreenRect) -> Result<()> {
        crate::capture::window::place(window, rect)
    }

    fn move_mouse(&self, x: i32, y: i32) -> Result<()> {
        super::input::move_mouse(x, y)
    }

    fn mouse_button(&self, button: MouseButton, down: bool) -> Result<()> {
        super::input::mouse_button(button, down)
    }

    fn key(&self, key: Key, down: bool) -> Result<()> {
        super::input::key(key, down)
    }

    fn type_text(&self, text: &str, interval: Duration) -> Result<()> {
        for c in text.chars() {
            super::input::type_char(c)?;
            self.sleep(interval);
        }
        Ok(())
    }

    fn capture_window(&self, window: &WindowInfo) -> Result<RgbaImage> {
        crate::capture::screenshot::capture_client_area(crate::capture::window::hwnd_of(window))
    }

    fn terminate_processes(&self, targets: &[ProcessTarget]) -> Result<usize> {
        super::process::terminate_matching(targets)
    }
}

/// Reports every UI operation as unsupported so the rest of the tool still runs.
#[cfg(not(windows))]
pub struct UnsupportedDesktop;

#[cfg(not(windows))]
fn unsupported<T>() -> Result<T> {
    Err(anyhow!("desktop automation is only supported on Windows"))
}

#[cfg(not(windows))]
impl Desktop for UnsupportedDesktop {
    fn screen_size(&self) -> Result<(i32, i32)> {
        unsupported()
    }

    fn find_window(&self, _fragment: &str) -> Result<Option<WindowInfo>> {
        unsupported()
    }

    fn activate_window(&self, _window: &WindowInfo) -> Result<()> {
        unsupported()
    }

    fn place_window(&self, _window: &WindowInfo, _rect: ScreenRect) -> Result<()> {
        unsupported()
    }

    fn move_mouse(&self, _x: i32, _y: i32) -> Result<()> {
        unsupported()
    }

    fn mouse_button(&self, _button: MouseButton, _down: bool) -> Result<()> {
        unsupported()
    }

    fn key(&self, _key: Key, _down: bool) -> Result<()> {
        unsupported()
    }

    fn type_text(&self, _text: &str, _interval: Duration) -> Result<()> {
        unsupported()
    }

    fn capture_window(&self, _window: &WindowInfo) -> Result<RgbaImage> {
        unsupported()
    }

    fn terminate_processes(&self, _targets: &[ProcessTarget]) -> Result<usize> {
        unsupported()
    }
}

/// The desktop for the current platform.
pub fn default_desktop() -> Box<dyn Desktop> {
    #[cfg(windows)]
    {
        Box::new(WindowsDesktop::new())
    }
    #[cfg(not(windows))]
    {
        Box::new(UnsupportedDesktop)
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_desktop_reports_platform() {
        let desktop = default_desktop();
        let err = desktop.find_window("Blender").unwrap_err();
        assert!(err.to_string().contains("only supported on Windows"));
        assert!(desktop.terminate_processes(&[]).is_err());
    }
}
