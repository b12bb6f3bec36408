//! Synthetic keyboard and mouse input through `SendInput`.
//!
//! SendInput simulates hardware-level input, so the target window has to be in
//! the foreground and the real cursor moves.

use anyhow::{anyhow, Result};

use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS,
    KEYEVENTF_KEYUP, KEYEVENTF_UNICODE, MOUSEEVENTF_ABSOLUTE, MOUSEEVENTF_LEFTDOWN,
    MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MOVE, MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP,
    MOUSEINPUT, VIRTUAL_KEY, VK_CONTROL, VK_DELETE, VK_F12, VK_MENU,
    VK_RETURN, VK_SHIFT,
};
use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

use super::{Key, MouseButton};

fn send(inputs: &[INPUT]) -> Result<()> {
    let sent = unsafe { SendInput(inputs, std::mem::size_of::<INPUT>() as i32) };
    if sent as usize != inputs.len() {
        return Err(anyhow!(
            "SendInput accepted {} of {} events",
            sent,
            inputs.len()
        ));
    }
    Ok(())
}

pub fn screen_size() -> (i32, i32) {
    unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) }
}

/// Moves the cursor to absolute screen coordinates.
pub fn move_mouse(x: i32, y: i32) -> Result<()> {
    // MOUSEEVENTF_ABSOLUTE expects coordinates normalized to 0-65535
    let (screen_width, screen_height) = screen_size();
    let norm_x = ((x as i64 * 65535) / screen_width.max(1) as i64) as i32;
    let norm_y = ((y as i64 * 65535) / screen_height.max(1) as i64) as i32;

    send(&[INPUT {
        r#type: INPUT_MOUSE,
        Anonymous: INPUT_0 {
            mi: MOUSEINPUT {
                dx: norm_x,
                dy: norm_y,
                dwFlags: MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE,
                ..Default::default()
            },
        },
    }])
}

/// Presses or releases a mouse button at the current cursor position.
pub fn mouse_button(button: MouseButton, down: bool) -> Result<()> {
    let flags = match (button, down) {
        (MouseButton::Left, true) => MOUSEEVENTF_LEFTDOWN,
        (MouseButton::Left, false) => MOUSEEVENTF_LEFTUP,
        (MouseButton::Right, true) => MOUSEEVENTF_RIGHTDOWN,
        (MouseButton::Right, false) => MOUSEEVENTF_RIGHTUP,
    };
    send(&[INPUT {
        r#type: INPUT_MOUSE,
        Anonymous: INPUT_0 {
            mi: MOUSEINPUT {
                dwFlags: flags,
                ..Default::default()
            },
        },
    }])
}

fn virtual_key(key: Key) -> Result<VIRTUAL_KEY> {
    Ok(match key {
        Key::Enter => VK_RETURN,
        Key::Delete => VK_DELETE,
        Key::Shift => VK_SHIFT,
        Key::Alt => VK_MENU,
        Key::Control => VK_CONTROL,
        Key::F12 => VK_F12,
        // Letter and digit virtual-key codes equal their uppercase ASCII value
        Key::Char(c) if c.is_ascii_alphanumeric() => VIRTUAL_KEY(c.to_ascii_uppercase() as u16),
        Key::Char(c) => return Err(anyhow!("No virtual key for {:?}", c)),
    })
}

pub fn key(key: Key, down: bool) -> Result<()> {
    let flags = if down {
        KEYBD_EVENT_FLAGS(0)
    } else {
        KEYEVENTF_KEYUP
    };
    send(&[INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: virtual_key(key)?,
                dwFlags: flags,
                ..Default::default()
            },
        },
    }])
}

/// Types one character as Unicode input, independent of the keyboard layout.
pub fn type_char(c: char) -> Result<()> {
    let mut units = [0u16; 2];
    let inputs: Vec<INPUT> = c
        .encode_utf16(&mut units)
        .iter()
        .flat_map(|&unit| {
            [KEYEVENTF_UNICODE, KEYEVENTF_UNICODE | KEYEVENTF_KEYUP].map(|flags| INPUT {
                r#type: INPUT_KEYBOARD,
                Anonymous: INPUT_0 {
                    ki: KEYBDINPUT {
                        wVk: VIRTUAL_KEY(0),
                        wScan: unit,
                        dwFlags: flags,
                        ..Default::default()
                    },
                },
            })
        })
        .collect();
    send(&inputs)
}
