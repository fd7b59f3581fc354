//! In-memory volume directory
//!
//! Behaves like a tiny OS mixer: endpoints, sessions and a focused process.
//! Used as the fallback backend where no native one exists, and by tests to
//! observe exactly which writes the engine issued.

use super::{SessionHandle, SessionState, VolumeDirectory, VolumeError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// A write observed by the in-memory mixer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeWrite {
    MasterOutput(u8),
    MasterInput(u8),
    Session { process_name: String, percent: u8 },
}

struct MemorySession {
    process_name: String,
    volume: u8,
}

struct MemoryMixer {
    output: Option<u8>,
    input: Option<u8>,
    sessions: BTreeMap<SessionHandle, MemorySession>,
    next_handle: u64,
    foreground: Option<String>,
    /// Sessions that never answer
    stalled: HashSet<SessionHandle>,
    writes: Vec<VolumeWrite>,
}

/// In-process mixer implementing [`VolumeDirectory`]
pub struct MemoryVolumeDirectory {
    inner: Mutex<MemoryMixer>,
}

impl MemoryVolumeDirectory {
    /// Mixer with both endpoints at 100% and no sessions
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryMixer {
                output: Some(100),
                input: Some(100),
                sessions: BTreeMap::new(),
                next_handle: 1,
                foreground: None,
                stalled: HashSet::new(),
                writes: Vec::new(),
            }),
        }
    }

    /// Add a session and return its handle
    pub fn add_session(&self, process_name: &str, volume: u8) -> SessionHandle {
        let mut mixer = self.inner.lock();
        let handle = SessionHandle(mixer.next_handle);
        mixer.next_handle += 1;
        mixer.sessions.insert(
            handle,
            MemorySession {
                process_name: process_name.to_string(),
                volume: volume.min(100),
            },
        );
        handle
    }

    pub fn remove_session(&self, handle: SessionHandle) {
        self.inner.lock().sessions.remove(&handle);
    }

    /// Change a session volume as another program would (not recorded)
    pub fn set_session_external(&self, handle: SessionHandle, volume: u8) {
        if let Some(session) = self.inner.lock().sessions.get_mut(&handle) {
            session.volume = volume.min(100);
        }
    }

    /// Change or remove the output endpoint (not recorded)
    pub fn set_output_external(&self, volume: Option<u8>) {
        self.inner.lock().output = volume.map(|v| v.min(100));
    }

    /// Change or remove the input endpoint (not recorded)
    pub fn set_input_external(&self, volume: Option<u8>) {
        self.inner.lock().input = volume.map(|v| v.min(100));
    }

    pub fn set_foreground(&self, process_name: Option<&str>) {
        self.inner.lock().foreground = process_name.map(str::to_string);
    }

    /// Make every call touching this session hang
    pub fn stall_session(&self, handle: SessionHandle) {
        self.inner.lock().stalled.insert(handle);
    }

    /// Current volume of a session
    pub fn session_volume(&self, handle: SessionHandle) -> Option<u8> {
        self.inner.lock().sessions.get(&handle).map(|s| s.volume)
    }

    pub fn output_volume(&self) -> Option<u8> {
        self.inner.lock().output
    }

    pub fn input_volume(&self) -> Option<u8> {
        self.inner.lock().input
    }

    /// Writes issued through the [`VolumeDirectory`] API so far
    pub fn writes(&self) -> Vec<VolumeWrite> {
        self.inner.lock().writes.clone()
    }

    /// Drain the recorded writes
    pub fn take_writes(&self) -> Vec<VolumeWrite> {
        std::mem::take(&mut self.inner.lock().writes)
    }

    fn is_stalled(&self, handle: SessionHandle) -> bool {
        self.inner.lock().stalled.contains(&handle)
    }
}

impl Default for MemoryVolumeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeDirectory for MemoryVolumeDirectory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_master_output(&self) -> Result<u8, VolumeError> {
        self.inner
            .lock()
            .output
            .ok_or_else(|| VolumeError::NotFound("output device".to_string()))
    }

    async fn set_master_output(&self, percent: u8) -> Result<(), VolumeError> {
        let mut mixer = self.inner.lock();
        if mixer.output.is_none() {
            return Err(VolumeError::NotFound("output device".to_string()));
        }
        mixer.output = Some(percent.min(100));
        mixer.writes.push(VolumeWrite::MasterOutput(percent));
        Ok(())
    }

    async fn get_master_input(&self) -> Result<u8, VolumeError> {
        self.inner
            .lock()
            .input
            .ok_or_else(|| VolumeError::NotFound("input device".to_string()))
    }

    async fn set_master_input(&self, percent: u8) -> Result<(), VolumeError> {
        let mut mixer = self.inner.lock();
        if mixer.input.is_none() {
            return Err(VolumeError::NotFound("input device".to_string()));
        }
        mixer.input = Some(percent.min(100));
        mixer.writes.push(VolumeWrite::MasterInput(percent));
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionState>, VolumeError> {
        let mixer = self.inner.lock();
        Ok(mixer
            .sessions
            .iter()
            .map(|(handle, s)| SessionState {
                handle: *handle,
                process_name: s.process_name.clone(),
                volume_percent: s.volume,
            })
            .collect())
    }

    async fn get_session_volume(&self, handle: SessionHandle) -> Result<u8, VolumeError> {
        if self.is_stalled(handle) {
            return std::future::pending().await;
        }
        self.inner
            .lock()
            .sessions
            .get(&handle)
            .map(|s| s.volume)
            .ok_or_else(|| VolumeError::NotFound(format!("session {}", handle)))
    }

    async fn set_session_volume(
        &self,
        handle: SessionHandle,
        percent: u8,
    ) -> Result<(), VolumeError> {
        if self.is_stalled(handle) {
            return std::future::pending().await;
        }
        let mut mixer = self.inner.lock();
        let process_name = match mixer.sessions.get_mut(&handle) {
            Some(session) => {
                session.volume = percent.min(100);
                session.process_name.clone()
            }
            None => return Err(VolumeError::NotFound(format!("session {}", handle))),
        };
        mixer.writes.push(VolumeWrite::Session {
            process_name,
            percent,
        });
        Ok(())
    }

    async fn current_foreground_process_name(&self) -> Option<String> {
        self.inner.lock().foreground.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = MemoryVolumeDirectory::new();
        let chrome = dir.add_session("chrome.exe", 40);

        assert_eq!(dir.get_session_volume(chrome).await, Ok(40));
        dir.set_session_volume(chrome, 70).await.unwrap();
        assert_eq!(dir.session_volume(chrome), Some(70));

        dir.remove_session(chrome);
        assert!(dir
            .get_session_volume(chrome)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            dir.writes(),
            vec![VolumeWrite::Session {
                process_name: "chrome.exe".to_string(),
                percent: 70
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_found() {
        let dir = MemoryVolumeDirectory::new();
        dir.set_input_external(None);

        assert!(dir.get_master_input().await.unwrap_err().is_not_found());
        assert!(dir.set_master_input(10).await.is_err());
        assert_eq!(dir.get_master_output().await, Ok(100));
        assert!(dir.take_writes().is_empty());
    }

    #[tokio::test]
    async fn test_external_changes_are_not_recorded() {
        let dir = MemoryVolumeDirectory::new();
        let h = dir.add_session("game.exe", 10);
        dir.set_session_external(h, 55);
        dir.set_output_external(Some(20));

        assert_eq!(dir.get_session_volume(h).await, Ok(55));
        assert_eq!(dir.get_master_output().await, Ok(20));
        assert!(dir.writes().is_empty());
    }
}
