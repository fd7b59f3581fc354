//! Key injection for button bindings
//!
//! Buttons on the slider box map to platform virtual-key codes. On Windows
//! the key is synthesised with `SendInput`; elsewhere the console injector
//! only logs what would have been pressed.

use anyhow::Result;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Platform virtual-key code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyCode(pub u16);

/// Named keys accepted in `button_mapping`
const NAMED_KEYS: &[(&str, u16)] = &[
    ("volume_mute", 0xAD),
    ("volume_down", 0xAE),
    ("volume_up", 0xAF),
    ("media_next", 0xB0),
    ("media_prev", 0xB1),
    ("media_stop", 0xB2),
    ("media_play_pause", 0xB3),
    ("f13", 0x7C),
    ("f14", 0x7D),
    ("f15", 0x7E),
    ("f16", 0x7F),
    ("f17", 0x80),
    ("f18", 0x81),
    ("f19", 0x82),
    ("f20", 0x83),
    ("f21", 0x84),
    ("f22", 0x85),
    ("f23", 0x86),
    ("f24", 0x87),
];

impl KeyCode {
    /// Look up a named key (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        NAMED_KEYS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, code)| KeyCode(*code))
    }

    /// Accept either a number or a key name from YAML
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(KeyCode),
            serde_yaml::Value::String(s) => Self::from_name(s).or_else(|| {
                let s = s.trim();
                match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u16::from_str_radix(hex, 16).ok().map(KeyCode),
                    None => s.parse::<u16>().ok().map(KeyCode),
                }
            }),
            _ => None,
        }
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NAMED_KEYS.iter().find(|(_, code)| *code == self.0) {
            Some((name, _)) => write!(f, "{} (0x{:02X})", name, self.0),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

/// Capability to synthesise a key press
pub trait KeyInjector: Send + Sync {
    /// Injector name for logs
    fn name(&self) -> &str;

    /// Press and release `key` once
    fn press(&self, key: KeyCode) -> Result<()>;
}

/// Logs key presses instead of injecting them
pub struct ConsoleKeyInjector {
    press_count: AtomicU64,
}

impl ConsoleKeyInjector {
    pub fn new() -> Self {
        Self {
            press_count: AtomicU64::new(0),
        }
    }

    /// Number of presses logged so far
    pub fn press_count(&self) -> u64 {
        self.press_count.load(Ordering::Relaxed)
    }
}

impl Default for ConsoleKeyInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyInjector for ConsoleKeyInjector {
    fn name(&self) -> &str {
        "console"
    }

    fn press(&self, key: KeyCode) -> Result<()> {
        let n = self.press_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "⌨️  [{}] key press {} [#{}]",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            key,
            n
        );
        Ok(())
    }
}

#[cfg(windows)]
pub use self::win::SendInputKeyInjector;

#[cfg(windows)]
mod win {
    use super::{KeyCode, KeyInjector};
    use anyhow::{bail, Result};
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYBD_EVENT_FLAGS,
        KEYEVENTF_KEYUP, VIRTUAL_KEY,
    };

    /// Injects key presses through `SendInput`
    pub struct SendInputKeyInjector;

    fn key_input(key: KeyCode, flags: KEYBD_EVENT_FLAGS) -> INPUT {
        INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: VIRTUAL_KEY(key.0),
                    wScan: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        }
    }

    impl KeyInjector for SendInputKeyInjector {
        fn name(&self) -> &str {
            "sendinput"
        }

        fn press(&self, key: KeyCode) -> Result<()> {
            let inputs = [
                key_input(key, KEYBD_EVENT_FLAGS(0)),
                key_input(key, KEYEVENTF_KEYUP),
            ];
            let sent = unsafe { SendInput(&inputs, std::mem::size_of::<INPUT>() as i32) };
            if sent as usize != inputs.len() {
                bail!("SendInput injected {} of {} events for {}", sent, inputs.len(), key);
            }
            Ok(())
        }
    }
}

/// Key injector for the current platform
pub fn platform_key_injector() -> Arc<dyn KeyInjector> {
    #[cfg(windows)]
    {
        debug!("Using SendInput key injector");
        Arc::new(SendInputKeyInjector)
    }
    #[cfg(not(windows))]
    {
        debug!("No native key injection on this platform, logging key presses");
        Arc::new(ConsoleKeyInjector::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys() {
        assert_eq!(KeyCode::from_name("media_play_pause"), Some(KeyCode(0xB3)));
        assert_eq!(KeyCode::from_name("F13"), Some(KeyCode(0x7C)));
        assert_eq!(KeyCode::from_name("nope"), None);
    }

    #[test]
    fn test_from_yaml() {
        let num: serde_yaml::Value = serde_yaml::from_str("176").unwrap();
        let name: serde_yaml::Value = serde_yaml::from_str("volume_mute").unwrap();
        let hex: serde_yaml::Value = serde_yaml::from_str("\"0xB1\"").unwrap();
        let bad: serde_yaml::Value = serde_yaml::from_str("[1, 2]").unwrap();
        let too_big: serde_yaml::Value = serde_yaml::from_str("70000").unwrap();

        assert_eq!(KeyCode::from_yaml(&num), Some(KeyCode(176)));
        assert_eq!(KeyCode::from_yaml(&name), Some(KeyCode(0xAD)));
        assert_eq!(KeyCode::from_yaml(&hex), Some(KeyCode(0xB1)));
        assert_eq!(KeyCode::from_yaml(&bad), None);
        assert_eq!(KeyCode::from_yaml(&too_big), None);
    }

    #[test]
    fn test_console_injector_counts() {
        let injector = ConsoleKeyInjector::new();
        injector.press(KeyCode(0xB3)).unwrap();
        injector.press(KeyCode(0x41)).unwrap();
        assert_eq!(injector.press_count(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyCode(0xB3).to_string(), "media_play_pause (0xB3)");
        assert_eq!(KeyCode(0x41).to_string(), "0x41");
    }
}
