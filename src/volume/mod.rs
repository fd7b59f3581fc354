//! Volume directory - the capability boundary to OS audio
//!
//! The sync engine only ever reaches audio state through [`VolumeDirectory`].
//! All percentages crossing this boundary are integers in 0-100; backends
//! convert to and from the OS scalar representation.

pub mod memory;
#[cfg(windows)]
pub mod windows;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryVolumeDirectory;
#[cfg(windows)]
pub use self::windows::WindowsVolumeDirectory;

/// Opaque handle to one audio session, valid until the next enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live audio-producing session as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub handle: SessionHandle,
    pub process_name: String,
    pub volume_percent: u8,
}

/// Errors reported across the volume boundary
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The target does not currently exist (no process, no session, no device)
    #[error("not found: {0}")]
    NotFound(String),
    /// The backend did not answer in time
    #[error("volume call timed out after {0} ms")]
    Timeout(u64),
    /// The OS call failed
    #[error("audio backend error: {0}")]
    Backend(String),
    /// The backend is gone (worker thread exited)
    #[error("audio backend unavailable")]
    Unavailable,
}

impl VolumeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VolumeError::NotFound(_))
    }
}

/// Get/set volume for system endpoints and application sessions
#[async_trait]
pub trait VolumeDirectory: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Default output device volume
    async fn get_master_output(&self) -> Result<u8, VolumeError>;

    async fn set_master_output(&self, percent: u8) -> Result<(), VolumeError>;

    /// Default input device volume
    async fn get_master_input(&self) -> Result<u8, VolumeError>;

    async fn set_master_input(&self, percent: u8) -> Result<(), VolumeError>;

    /// Enumerate live sessions. Handles from a previous call may go stale.
    async fn list_sessions(&self) -> Result<Vec<SessionState>, VolumeError>;

    async fn get_session_volume(&self, handle: SessionHandle) -> Result<u8, VolumeError>;

    async fn set_session_volume(
        &self,
        handle: SessionHandle,
        percent: u8,
    ) -> Result<(), VolumeError>;

    /// Executable name of the focused process, `None` when unresolved
    async fn current_foreground_process_name(&self) -> Option<String>;
}

/// Scalar (0.0-1.0) <-> percentage conversions
///
/// Rounds to nearest: a percentage written and read back must be the same
/// integer.
pub mod convert {
    pub fn scalar_to_percent(scalar: f32) -> u8 {
        (scalar.clamp(0.0, 1.0) * 100.0).round() as u8
    }

    pub fn percent_to_scalar(percent: u8) -> f32 {
        f32::from(percent.min(100)) / 100.0
    }
}

/// Volume directory for the current platform
pub fn platform_directory() -> anyhow::Result<Arc<dyn VolumeDirectory>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(WindowsVolumeDirectory::spawn()?))
    }
    #[cfg(not(windows))]
    {
        tracing::warn!("No native audio backend on this platform, using in-memory mixer");
        Ok(Arc::new(MemoryVolumeDirectory::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::convert::*;

    #[test]
    fn test_percent_round_trip_is_stable() {
        for percent in 0..=100u8 {
            assert_eq!(scalar_to_percent(percent_to_scalar(percent)), percent);
        }
    }

    #[test]
    fn test_scalar_clamping() {
        assert_eq!(scalar_to_percent(-0.5), 0);
        assert_eq!(scalar_to_percent(1.7), 100);
        assert_eq!(scalar_to_percent(0.29999), 30);
        assert_eq!(percent_to_scalar(150), 1.0);
    }
}
