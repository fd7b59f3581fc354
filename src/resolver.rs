//! Target resolver - slider/button bindings built from configuration
//!
//! Bindings are constructed once at startup and never change afterwards.
//! Configuration entries that cannot be understood are dropped with a
//! warning so the remaining bindings still load.

use crate::config::AppConfig;
use crate::keys::KeyCode;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Alias for the focused application
pub const CURRENT_APP_ALIAS: &str = "deej.current";

/// Alias for every session not bound elsewhere
pub const UNMAPPED_ALIAS: &str = "deej.unmapped";

/// Suffixes that mark a name as an executable
const EXECUTABLE_SUFFIXES: &[&str] = &[".exe"];

/// A volume target a slider can drive
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetRef {
    /// System output volume
    Master,
    /// System input volume
    Microphone,
    /// Whatever process has focus when the event is handled
    CurrentForegroundApp,
    /// All sessions not named by any binding, minus the focused one
    UnmappedApps,
    /// A specific executable, matched case-insensitively
    NamedProcess(String),
}

impl TargetRef {
    /// Classify a configuration name
    ///
    /// Returns `None` when the name is neither a known alias nor an
    /// executable name.
    pub fn classify(name: &str) -> Option<Self> {
        let name = name.trim();
        let lower = name.to_lowercase();

        match lower.as_str() {
            "master" => Some(TargetRef::Master),
            "mic" => Some(TargetRef::Microphone),
            CURRENT_APP_ALIAS => Some(TargetRef::CurrentForegroundApp),
            UNMAPPED_ALIAS => Some(TargetRef::UnmappedApps),
            _ if EXECUTABLE_SUFFIXES.iter().any(|s| lower.ends_with(s)) && lower.len() > 4 => {
                Some(TargetRef::NamedProcess(name.to_string()))
            }
            _ => None,
        }
    }

    /// Whether a session's process name matches this named target
    pub fn matches_process(&self, process_name: &str) -> bool {
        match self {
            TargetRef::NamedProcess(name) => name.eq_ignore_ascii_case(process_name),
            _ => false,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Master => write!(f, "master"),
            TargetRef::Microphone => write!(f, "mic"),
            TargetRef::CurrentForegroundApp => write!(f, "{}", CURRENT_APP_ALIAS),
            TargetRef::UnmappedApps => write!(f, "{}", UNMAPPED_ALIAS),
            TargetRef::NamedProcess(name) => write!(f, "{}", name),
        }
    }
}

/// Slider index and the targets it drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliderBinding {
    pub index: usize,
    pub targets: Vec<TargetRef>,
}

/// Button index and the key it presses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonBinding {
    pub index: usize,
    pub key: KeyCode,
}

/// Immutable binding table
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    sliders: BTreeMap<usize, SliderBinding>,
    buttons: BTreeMap<usize, ButtonBinding>,
    /// Lower-cased explicit process names across all sliders
    explicit_names: HashSet<String>,
}

impl Bindings {
    /// Build bindings from the raw configuration mappings
    pub fn from_config(config: &AppConfig) -> Self {
        let mut sliders = Vec::new();
        for (key, value) in &config.slider_mapping {
            let Some(index) = parse_index(key) else {
                warn!("Dropping slider mapping with invalid index {:?}", key);
                continue;
            };

            let names = match target_names(value) {
                Some(names) => names,
                None => {
                    warn!("Dropping slider {} mapping: expected a name or list of names", index);
                    continue;
                }
            };

            let mut targets = Vec::new();
            for name in names {
                match TargetRef::classify(&name) {
                    Some(target) => {
                        debug!("Slider {} -> {}", index, target);
                        targets.push(target);
                    }
                    None => warn!("Dropping unknown target '{}' on slider {}", name, index),
                }
            }

            sliders.push(SliderBinding { index, targets });
        }

        let mut buttons = Vec::new();
        for (key, value) in &config.button_mapping {
            let Some(index) = parse_index(key) else {
                warn!("Dropping button mapping with invalid index {:?}", key);
                continue;
            };
            match KeyCode::from_yaml(value) {
                Some(key) => {
                    debug!("Button {} -> {}", index, key);
                    buttons.push(ButtonBinding { index, key });
                }
                None => warn!("Dropping button {} mapping: unknown key {:?}", index, value),
            }
        }

        Self::new(sliders, buttons)
    }

    /// Build bindings from already-classified entries
    ///
    /// A later binding for an index replaces an earlier one.
    pub fn new(sliders: Vec<SliderBinding>, buttons: Vec<ButtonBinding>) -> Self {
        let sliders: BTreeMap<usize, SliderBinding> =
            sliders.into_iter().map(|b| (b.index, b)).collect();
        let buttons = buttons.into_iter().map(|b| (b.index, b)).collect();

        let explicit_names = sliders
            .values()
            .flat_map(|b| b.targets.iter())
            .filter_map(|t| match t {
                TargetRef::NamedProcess(name) => Some(name.to_lowercase()),
                _ => None,
            })
            .collect();

        Self {
            sliders,
            buttons,
            explicit_names,
        }
    }

    /// Targets bound to a slider, empty when unbound
    pub fn targets_for(&self, index: usize) -> &[TargetRef] {
        self.sliders
            .get(&index)
            .map(|b| b.targets.as_slice())
            .unwrap_or(&[])
    }

    /// Key bound to a button
    pub fn key_for(&self, index: usize) -> Option<KeyCode> {
        self.buttons.get(&index).map(|b| b.key)
    }

    /// Slider index a target name is bound to (case-insensitive)
    pub fn slider_for_name(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.sliders
            .values()
            .find(|b| {
                b.targets
                    .iter()
                    .any(|t| t.to_string().eq_ignore_ascii_case(name))
            })
            .map(|b| b.index)
    }

    /// Sliders with at least one target, in index order
    pub fn bound_sliders(&self) -> impl Iterator<Item = &SliderBinding> {
        self.sliders.values().filter(|b| !b.targets.is_empty())
    }

    /// All slider bindings, bound or not, in index order
    pub fn sliders(&self) -> impl Iterator<Item = &SliderBinding> {
        self.sliders.values()
    }

    /// All button bindings in index order
    pub fn buttons(&self) -> impl Iterator<Item = &ButtonBinding> {
        self.buttons.values()
    }

    /// Lower-cased names of every explicitly bound process
    pub fn explicit_process_names(&self) -> &HashSet<String> {
        &self.explicit_names
    }

    /// Whether a process is named by any binding
    pub fn is_explicitly_bound(&self, process_name: &str) -> bool {
        self.explicit_names.contains(&process_name.to_lowercase())
    }

    /// Sliders bound to the focused-application alias
    pub fn foreground_sliders(&self) -> Vec<usize> {
        self.bound_sliders()
            .filter(|b| b.targets.contains(&TargetRef::CurrentForegroundApp))
            .map(|b| b.index)
            .collect()
    }

    /// Whether any slider needs the foreground process resolved
    pub fn uses_foreground(&self) -> bool {
        self.bound_sliders().any(|b| {
            b.targets.iter().any(|t| {
                matches!(t, TargetRef::CurrentForegroundApp | TargetRef::UnmappedApps)
            })
        })
    }
}

fn parse_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A single name or a list of names; blank entries are skipped
fn target_names(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(
            Some(s.trim().to_string())
                .filter(|s| !s.is_empty())
                .into_iter()
                .collect(),
        ),
        Value::Sequence(items) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings_from(yaml: &str) -> Bindings {
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        Bindings::from_config(&config)
    }

    #[test]
    fn test_classify_precedence() {
        assert_eq!(TargetRef::classify("master"), Some(TargetRef::Master));
        assert_eq!(TargetRef::classify("MIC"), Some(TargetRef::Microphone));
        assert_eq!(
            TargetRef::classify("deej.current"),
            Some(TargetRef::CurrentForegroundApp)
        );
        assert_eq!(
            TargetRef::classify("deej.unmapped"),
            Some(TargetRef::UnmappedApps)
        );
        assert_eq!(
            TargetRef::classify("Spotify.EXE"),
            Some(TargetRef::NamedProcess("Spotify.EXE".to_string()))
        );
        assert_eq!(TargetRef::classify("spotify"), None);
        assert_eq!(TargetRef::classify(".exe"), None);
    }

    #[test]
    fn test_from_config_drops_bad_entries() {
        let bindings = bindings_from(
            r#"
slider_mapping:
  0: master
  1: [chrome.exe, "not a target", " spotify.exe "]
  2: 42
  nope: mic
  3: []
button_mapping:
  0: media_play_pause
  1: definitely_not_a_key
"#,
        );

        assert_eq!(bindings.targets_for(0), &[TargetRef::Master]);
        assert_eq!(
            bindings.targets_for(1),
            &[
                TargetRef::NamedProcess("chrome.exe".to_string()),
                TargetRef::NamedProcess("spotify.exe".to_string()),
            ]
        );
        assert!(bindings.targets_for(2).is_empty());
        assert!(bindings.targets_for(3).is_empty());
        assert!(bindings.targets_for(99).is_empty());
        assert_eq!(bindings.bound_sliders().count(), 2);

        assert_eq!(bindings.key_for(0), Some(KeyCode(0xB3)));
        assert_eq!(bindings.key_for(1), None);
    }

    #[test]
    fn test_reverse_lookup_is_case_insensitive() {
        let bindings = bindings_from(
            r#"
slider_mapping:
  0: master
  2: [Discord.exe, deej.current]
"#,
        );

        assert_eq!(bindings.slider_for_name("MASTER"), Some(0));
        assert_eq!(bindings.slider_for_name("discord.EXE"), Some(2));
        assert_eq!(bindings.slider_for_name("deej.current"), Some(2));
        assert_eq!(bindings.slider_for_name("mic"), None);
        assert_eq!(bindings.foreground_sliders(), vec![2]);
        assert!(bindings.uses_foreground());
    }

    #[test]
    fn test_explicit_process_names() {
        let bindings = bindings_from(
            r#"
slider_mapping:
  0: [Chrome.exe, master]
  1: [spotify.exe, deej.unmapped]
"#,
        );

        assert!(bindings.is_explicitly_bound("chrome.exe"));
        assert!(bindings.is_explicitly_bound("SPOTIFY.EXE"));
        assert!(!bindings.is_explicitly_bound("master"));
        assert_eq!(bindings.explicit_process_names().len(), 2);
    }
}
