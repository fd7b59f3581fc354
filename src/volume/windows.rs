//! Windows Core Audio backend
//!
//! COM interfaces are apartment-bound, so every OS call happens on one
//! dedicated worker thread. [`WindowsVolumeDirectory`] is the handle: it sends
//! an [`AudioCommand`] over a channel and awaits the oneshot reply.
//!
//! ```text
//!  sync engine ──► WindowsVolumeDirectory ──cmd──► com-audio thread
//!                         ▲                             │
//!                         └──────── oneshot reply ◄─────┘
//! ```

use super::convert::{percent_to_scalar, scalar_to_percent};
use super::{SessionHandle, SessionState, VolumeDirectory, VolumeError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HMODULE};
use windows::Win32::Media::Audio::Endpoints::IAudioEndpointVolume;
use windows::Win32::Media::Audio::{
    eCapture, eMultimedia, eRender, EDataFlow, IAudioSessionControl2, IAudioSessionManager2,
    IMMDeviceEnumerator, ISimpleAudioVolume, MMDeviceEnumerator,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
};
use windows::Win32::System::ProcessStatus::GetModuleBaseNameW;
use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

type Reply<T> = oneshot::Sender<Result<T, VolumeError>>;

/// Requests handled by the COM worker
enum AudioCommand {
    GetEndpoint {
        flow: EDataFlow,
        reply: Reply<u8>,
    },
    SetEndpoint {
        flow: EDataFlow,
        percent: u8,
        reply: Reply<()>,
    },
    ListSessions {
        reply: Reply<Vec<SessionState>>,
    },
    GetSession {
        handle: SessionHandle,
        reply: Reply<u8>,
    },
    SetSession {
        handle: SessionHandle,
        percent: u8,
        reply: Reply<()>,
    },
    Foreground {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Volume directory backed by Windows Core Audio
pub struct WindowsVolumeDirectory {
    cmd_tx: mpsc::UnboundedSender<AudioCommand>,
}

impl WindowsVolumeDirectory {
    /// Start the COM worker thread
    ///
    /// Fails when COM or the device enumerator cannot be initialised.
    pub fn spawn() -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        std::thread::Builder::new()
            .name("com-audio".to_string())
            .spawn(move || run_worker(cmd_rx, ready_tx))
            .context("Failed to spawn audio worker thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("🔊 Core Audio backend ready");
                Ok(Self { cmd_tx })
            }
            Ok(Err(e)) => anyhow::bail!("Core Audio initialisation failed: {}", e),
            Err(_) => anyhow::bail!("Audio worker thread exited during startup"),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> AudioCommand,
    ) -> Result<T, VolumeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .map_err(|_| VolumeError::Unavailable)?;
        rx.await.map_err(|_| VolumeError::Unavailable)?
    }
}

#[async_trait]
impl VolumeDirectory for WindowsVolumeDirectory {
    fn name(&self) -> &str {
        "core-audio"
    }

    async fn get_master_output(&self) -> Result<u8, VolumeError> {
        self.request(|reply| AudioCommand::GetEndpoint { flow: eRender, reply })
            .await
    }

    async fn set_master_output(&self, percent: u8) -> Result<(), VolumeError> {
        self.request(|reply| AudioCommand::SetEndpoint {
            flow: eRender,
            percent,
            reply,
        })
        .await
    }

    async fn get_master_input(&self) -> Result<u8, VolumeError> {
        self.request(|reply| AudioCommand::GetEndpoint { flow: eCapture, reply })
            .await
    }

    async fn set_master_input(&self, percent: u8) -> Result<(), VolumeError> {
        self.request(|reply| AudioCommand::SetEndpoint {
            flow: eCapture,
            percent,
            reply,
        })
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionState>, VolumeError> {
        self.request(|reply| AudioCommand::ListSessions { reply }).await
    }

    async fn get_session_volume(&self, handle: SessionHandle) -> Result<u8, VolumeError> {
        self.request(|reply| AudioCommand::GetSession { handle, reply })
            .await
    }

    async fn set_session_volume(
        &self,
        handle: SessionHandle,
        percent: u8,
    ) -> Result<(), VolumeError> {
        self.request(|reply| AudioCommand::SetSession {
            handle,
            percent,
            reply,
        })
        .await
    }

    async fn current_foreground_process_name(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(AudioCommand::Foreground { reply }).ok()?;
        rx.await.ok().flatten()
    }
}

// ============================================================================
// Worker thread
// ============================================================================

/// State owned by the COM thread
struct AudioWorker {
    enumerator: IMMDeviceEnumerator,
    /// Session volumes from the latest enumeration
    sessions: HashMap<SessionHandle, ISimpleAudioVolume>,
    next_handle: u64,
}

fn run_worker(
    mut cmd_rx: mpsc::UnboundedReceiver<AudioCommand>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let init = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
    if let Err(e) = init.ok() {
        let _ = ready_tx.send(Err(format!("CoInitializeEx: {}", e)));
        return;
    }

    let enumerator: IMMDeviceEnumerator =
        match unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) } {
            Ok(enumerator) => enumerator,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("MMDeviceEnumerator: {}", e)));
                unsafe { CoUninitialize() };
                return;
            }
        };

    let mut worker = AudioWorker {
        enumerator,
        sessions: HashMap::new(),
        next_handle: 1,
    };
    let _ = ready_tx.send(Ok(()));

    while let Some(cmd) = cmd_rx.blocking_recv() {
        worker.handle(cmd);
    }

    debug!("Audio worker stopping");
    // COM objects must be released before the apartment goes away
    drop(worker);
    unsafe { CoUninitialize() };
}

impl AudioWorker {
    fn handle(&mut self, cmd: AudioCommand) {
        match cmd {
            AudioCommand::GetEndpoint { flow, reply } => {
                let _ = reply.send(self.endpoint_volume(flow));
            }
            AudioCommand::SetEndpoint {
                flow,
                percent,
                reply,
            } => {
                let _ = reply.send(self.set_endpoint_volume(flow, percent));
            }
            AudioCommand::ListSessions { reply } => {
                let _ = reply.send(self.enumerate_sessions());
            }
            AudioCommand::GetSession { handle, reply } => {
                let _ = reply.send(self.session_volume(handle));
            }
            AudioCommand::SetSession {
                handle,
                percent,
                reply,
            } => {
                let _ = reply.send(self.set_session_volume(handle, percent));
            }
            AudioCommand::Foreground { reply } => {
                let _ = reply.send(foreground_process_name());
            }
        }
    }

    /// Default endpoint volume control; a missing device is `NotFound`
    fn endpoint(&self, flow: EDataFlow) -> Result<IAudioEndpointVolume, VolumeError> {
        unsafe {
            let device = self
                .enumerator
                .GetDefaultAudioEndpoint(flow, eMultimedia)
                .map_err(|e| VolumeError::NotFound(format!("default endpoint: {}", e)))?;
            device
                .Activate::<IAudioEndpointVolume>(CLSCTX_ALL, None)
                .map_err(backend)
        }
    }

    fn endpoint_volume(&self, flow: EDataFlow) -> Result<u8, VolumeError> {
        let endpoint = self.endpoint(flow)?;
        let scalar = unsafe { endpoint.GetMasterVolumeLevelScalar() }.map_err(backend)?;
        Ok(scalar_to_percent(scalar))
    }

    fn set_endpoint_volume(&self, flow: EDataFlow, percent: u8) -> Result<(), VolumeError> {
        let endpoint = self.endpoint(flow)?;
        unsafe { endpoint.SetMasterVolumeLevelScalar(percent_to_scalar(percent), std::ptr::null()) }
            .map_err(backend)
    }

    /// Re-enumerate render sessions; previous handles become stale
    fn enumerate_sessions(&mut self) -> Result<Vec<SessionState>, VolumeError> {
        self.sessions.clear();
        let mut result = Vec::new();

        unsafe {
            let device = match self.enumerator.GetDefaultAudioEndpoint(eRender, eMultimedia) {
                Ok(device) => device,
                Err(e) => {
                    debug!("No render endpoint, no sessions: {}", e);
                    return Ok(result);
                }
            };
            let manager: IAudioSessionManager2 =
                device.Activate(CLSCTX_ALL, None).map_err(backend)?;
            let sessions = manager.GetSessionEnumerator().map_err(backend)?;
            let count = sessions.GetCount().map_err(backend)?;

            for i in 0..count {
                let Ok(session) = sessions.GetSession(i) else {
                    continue;
                };
                let Ok(control) = session.cast::<IAudioSessionControl2>() else {
                    continue;
                };
                let Ok(pid) = control.GetProcessId() else {
                    continue;
                };
                // pid 0 is the system sounds session
                if pid == 0 {
                    continue;
                }
                let Some(process_name) = process_name(pid) else {
                    trace!("Skipping session of unnamed pid {}", pid);
                    continue;
                };
                let Ok(volume) = session.cast::<ISimpleAudioVolume>() else {
                    continue;
                };
                let Ok(scalar) = volume.GetMasterVolume() else {
                    continue;
                };

                let handle = SessionHandle(self.next_handle);
                self.next_handle += 1;
                self.sessions.insert(handle, volume);
                result.push(SessionState {
                    handle,
                    process_name,
                    volume_percent: scalar_to_percent(scalar),
                });
            }
        }

        trace!("Enumerated {} audio sessions", result.len());
        Ok(result)
    }

    fn session(&self, handle: SessionHandle) -> Result<&ISimpleAudioVolume, VolumeError> {
        self.sessions
            .get(&handle)
            .ok_or_else(|| VolumeError::NotFound(format!("session {}", handle)))
    }

    fn session_volume(&self, handle: SessionHandle) -> Result<u8, VolumeError> {
        let scalar = unsafe { self.session(handle)?.GetMasterVolume() }.map_err(backend)?;
        Ok(scalar_to_percent(scalar))
    }

    fn set_session_volume(&self, handle: SessionHandle, percent: u8) -> Result<(), VolumeError> {
        unsafe {
            self.session(handle)?
                .SetMasterVolume(percent_to_scalar(percent), std::ptr::null())
        }
        .map_err(backend)
    }
}

fn backend(e: windows::core::Error) -> VolumeError {
    VolumeError::Backend(e.to_string())
}

/// Lower-cased executable name of a process
fn process_name(pid: u32) -> Option<String> {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid).ok()?;
        let mut buffer = [0u16; 260];
        let len = GetModuleBaseNameW(handle, HMODULE::default(), &mut buffer);
        let _ = CloseHandle(handle);
        if len == 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buffer[..len as usize]).to_lowercase())
    }
}

fn foreground_process_name() -> Option<String> {
    unsafe {
        let hwnd = GetForegroundWindow();
        if hwnd.0 == 0 {
            return None;
        }
        let mut pid = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
        if pid == 0 {
            trace!("Foreground window has no owning process");
            return None;
        }
        process_name(pid)
    }
}
