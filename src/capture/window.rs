//! Window discovery and placement through the Win32 API.

use anyhow::{anyhow, Result};
use std::ffi::OsString;
use std::os::windows::ffi::OsStringExt;

use windows::Win32::Foundation::{BOOL, HWND, LPARAM, POINT, RECT, TRUE};
use windows::Win32::Graphics::Gdi::ClientToScreen;
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClientRect, GetWindowRect, GetWindowTextLengthW, GetWindowTextW,
    GetWindowThreadProcessId, IsIconic, IsWindowVisible, MoveWindow, SetForegroundWindow,
    ShowWindow, SW_RESTORE,
};

use crate::automation::{ScreenRect, WindowInfo};

pub fn hwnd_of(window: &WindowInfo) -> HWND {
    HWND(window.handle as *mut std::ffi::c_void)
}

fn window_title(hwnd: HWND) -> String {
    unsafe {
        let title_len = GetWindowTextLengthW(hwnd);
        if title_len <= 0 {
            return String::new();
        }
        let mut title_buf: Vec<u16> = vec![0; (title_len + 1) as usize];
        let copied = GetWindowTextW(hwnd, &mut title_buf).max(0) as usize;
        OsString::from_wide(&title_buf[..copied.min(title_len as usize)])
            .to_string_lossy()
            .to_string()
    }
}

/// Executable name of the process owning `hwnd`, for diagnostics.
fn process_name(hwnd: HWND) -> Option<String> {
    unsafe {
        let mut process_id: u32 = 0;
        GetWindowThreadProcessId(hwnd, Some(&mut process_id));
        if process_id == 0 {
            return None;
        }
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, process_id).ok()?;

        let mut name_buf: Vec<u16> = vec![0; 1024];
        let mut len = name_buf.len() as u32;
        let result = QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            windows::core::PWSTR(name_buf.as_mut_ptr()),
            &mut len,
        );
        let _ = windows::Win32::Foundation::CloseHandle(handle);
        if result.is_err() || len == 0 {
            return None;
        }

        let full_path = OsString::from_wide(&name_buf[..len as usize])
            .to_string_lossy()
            .to_string();
        full_path.rsplit('\\').next().map(str::to_string)
    }
}

pub fn window_rect(hwnd: HWND) -> Result<ScreenRect> {
    let mut rect = RECT::default();
    unsafe { GetWindowRect(hwnd, &mut rect)? };
    Ok(ScreenRect {
        left: rect.left,
        top: rect.top,
        width: rect.right - rect.left,
        height: rect.bottom - rect.top,
    })
}

/// Finds the first visible window whose title contains `fragment`, ignoring case.
pub fn find_window_by_title(fragment: &str) -> Result<Option<WindowInfo>> {
    struct EnumData {
        fragment: String,
        hwnd: Option<HWND>,
        title: String,
    }

    unsafe extern "system" fn enum_callback(hwnd: HWND, lparam: LPARAM) -> BOOL {
        unsafe {
            let data = &mut *(lparam.0 as *mut EnumData);

            if !IsWindowVisible(hwnd).as_bool() {
                return TRUE;
            }

            // Windows without a title are not top-level application windows
            let title = window_title(hwnd);
            if title.is_empty() || !title.to_lowercase().contains(&data.fragment) {
                return TRUE;
            }

            data.hwnd = Some(hwnd);
            data.title = title;
            BOOL(0) // Stop enumeration
        }
    }

    let mut data = EnumData {
        fragment: fragment.to_lowercase(),
        hwnd: None,
        title: String::new(),
    };
    unsafe {
        // EnumWindows returns FALSE when the callback stops it early, which is not an error
        let _ = EnumWindows(Some(enum_callback), LPARAM(&mut data as *mut _ as isize));
    }

    let Some(hwnd) = data.hwnd else {
        tracing::trace!("No window matching \"{}\"", fragment);
        return Ok(None);
    };
    tracing::debug!(
        "Found window \"{}\" ({}) for \"{}\"",
        data.title,
        process_name(hwnd).unwrap_or_else(|| "unknown process".to_string()),
        fragment
    );

    Ok(Some(WindowInfo {
        handle: hwnd.0 as isize,
        title: data.title,
        rect: window_rect(hwnd)?,
    }))
}

/// Restores and brings `window` to the foreground.
pub fn activate(window: &WindowInfo) -> Result<()> {
    let hwnd = hwnd_of(window);
    unsafe {
        if IsIconic(hwnd).as_bool() {
            let _ = ShowWindow(hwnd, SW_RESTORE);
        }
        if !SetForegroundWindow(hwnd).as_bool() {
            tracing::warn!("SetForegroundWindow refused for \"{}\"", window.title);
        }
    }
    Ok(())
}

pub fn place(window: &WindowInfo, rect: ScreenRect) -> Result<()> {
    unsafe {
        MoveWindow(
            hwnd_of(window),
            rect.left,
            rect.top,
            rect.width,
            rect.height,
            true,
        )?;
    }
    Ok(())
}

/// Gets the client area rectangle and its offset relative to the window origin.
///
/// The offset is needed to crop a full-window capture down to the client area.
pub fn get_client_area_info(hwnd: HWND) -> Result<(RECT, POINT)> {
    let mut client_rect = RECT::default();
    unsafe { GetClientRect(hwnd, &mut client_rect)? };

    let mut client_origin = POINT { x: 0, y: 0 };
    unsafe {
        if !ClientToScreen(hwnd, &mut client_origin).as_bool() {
            return Err(anyhow!("ClientToScreen failed"));
        }
    }

    let mut window_rect = RECT::default();
    unsafe { GetWindowRect(hwnd, &mut window_rect)? };

    let offset = POINT {
        x: client_origin.x - window_rect.left,
        y: client_origin.y - window_rect.top,
    };

    Ok((client_rect, offset))
}
