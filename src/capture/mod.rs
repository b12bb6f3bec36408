//! Browser, capture tool and window capture stages.
//!
//! This module provides:
//! - The satellite map URL and browser launch (`browser`)
//! - RenderDoc injection and frame capture driven through a `Desktop` (`renderdoc`)
//! - Win32 window discovery and client-area screenshots (Windows only)

pub mod browser;
pub mod renderdoc;
#[cfg(windows)]
pub mod screenshot;
#[cfg(windows)]
pub mod window;
