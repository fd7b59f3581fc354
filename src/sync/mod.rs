//! Sync engine - keeps the slider box and OS volumes consistent
//!
//! Two paths share one [`SyncState`]:
//! - hardware to OS ([`SyncEngine::dispatch`]) applies slider frames and
//!   button presses,
//! - OS to hardware ([`SyncEngine::reconcile_tick`]) pushes external volume
//!   changes back to the device.
//!
//! The state mutex is the feedback-suppression critical section. A dispatch
//! holds it until every write it started has finished, and a tick that finds
//! it held is skipped, so a tick never observes a half-applied change.

mod dispatch;
mod reconcile;


pub use dispatch::DispatchReport;
pub use reconcile::TickReport;

use crate::arduino::DeviceSink;
use crate::config::SyncConfig;
use crate::keys::KeyInjector;
use crate::resolver::{Bindings, TargetRef};
use crate::volume::{SessionState, VolumeDirectory, VolumeError};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// Engine timing and bounds
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub reconcile_interval: Duration,
    pub volume_call_timeout: Duration,
    pub max_concurrent_writes: usize,
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            volume_call_timeout: config.volume_call_timeout(),
            max_concurrent_writes: config.max_concurrent_writes,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Last percentage known to be shown by each hardware slider
#[derive(Debug, Clone, Default)]
pub struct HardwareSliderCache {
    values: BTreeMap<usize, u8>,
}

impl HardwareSliderCache {
    pub fn get(&self, index: usize) -> Option<u8> {
        self.values.get(&index).copied()
    }

    pub fn set(&mut self, index: usize, percent: u8) {
        self.values.insert(index, percent);
    }

    pub fn snapshot(&self) -> BTreeMap<usize, u8> {
        self.values.clone()
    }
}

/// State shared by dispatch and reconciliation
#[derive(Debug, Default)]
pub struct SyncState {
    pub hardware: HardwareSliderCache,
    /// Button index -> last seen pressed state
    pub buttons: HashMap<usize, bool>,
}

/// Bidirectional slider/volume synchronisation
pub struct SyncEngine {
    bindings: Arc<Bindings>,
    directory: Arc<dyn VolumeDirectory>,
    device: Arc<dyn DeviceSink>,
    keys: Arc<dyn KeyInjector>,
    state: Mutex<SyncState>,
    write_permits: Arc<Semaphore>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        bindings: Arc<Bindings>,
        directory: Arc<dyn VolumeDirectory>,
        device: Arc<dyn DeviceSink>,
        keys: Arc<dyn KeyInjector>,
        options: SyncOptions,
    ) -> Self {
        info!(
            "Sync engine: {} bound sliders, {} buttons, backend '{}', keys '{}'",
            bindings.bound_sliders().count(),
            bindings.buttons().count(),
            directory.name(),
            keys.name()
        );

        Self {
            write_permits: Arc::new(Semaphore::new(options.max_concurrent_writes.max(1))),
            bindings,
            directory,
            device,
            keys,
            state: Mutex::new(SyncState::default()),
            options,
        }
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Copy of the hardware slider cache
    pub async fn hardware_snapshot(&self) -> BTreeMap<usize, u8> {
        self.state.lock().await.hardware.snapshot()
    }

    /// Focused process name, bounded by the call timeout
    pub async fn current_foreground(&self) -> Option<String> {
        tokio::time::timeout(
            self.options.volume_call_timeout,
            self.directory.current_foreground_process_name(),
        )
        .await
        .unwrap_or_else(|_| {
            debug!("Foreground lookup timed out");
            None
        })
    }

    /// Live sessions, or `None` when the backend failed (logged)
    async fn sessions(&self) -> Option<Vec<SessionState>> {
        match with_timeout(self.options.volume_call_timeout, self.directory.list_sessions()).await
        {
            Ok(sessions) => Some(sessions),
            Err(e) => {
                debug!("Session enumeration failed: {}", e);
                None
            }
        }
    }

    /// Run the OS to hardware reconciliation on a fixed interval
    pub fn spawn_reconcile_loop(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.options.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(
                "Reconcile loop started ({:?} interval)",
                engine.options.reconcile_interval
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.reconcile_tick().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Reconcile loop stopped");
        })
    }
}

/// Bound a volume call by `limit`
async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, VolumeError>>,
) -> Result<T, VolumeError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(VolumeError::Timeout(limit.as_millis() as u64)),
    }
}

/// Whether a target is resolved through the session list
fn is_session_target(target: &TargetRef) -> bool {
    !matches!(target, TargetRef::Master | TargetRef::Microphone)
}

/// Whether a target needs the focused process resolved
fn needs_foreground(target: &TargetRef) -> bool {
    matches!(
        target,
        TargetRef::CurrentForegroundApp | TargetRef::UnmappedApps
    )
}

/// Sessions a session-backed target currently covers
///
/// `UnmappedApps` is every session not named by a binding and not in focus.
/// `CurrentForegroundApp` is empty when the focused process is unresolved.
fn matching_sessions<'a>(
    target: &TargetRef,
    sessions: &'a [SessionState],
    foreground: Option<&str>,
    bindings: &Bindings,
) -> Vec<&'a SessionState> {
    let is_foreground =
        |s: &SessionState| foreground.is_some_and(|fg| fg.eq_ignore_ascii_case(&s.process_name));

    let matched: Vec<&SessionState> = match target {
        TargetRef::Master | TargetRef::Microphone => Vec::new(),
        TargetRef::NamedProcess(_) => sessions
            .iter()
            .filter(|s| target.matches_process(&s.process_name))
            .collect(),
        TargetRef::CurrentForegroundApp => sessions.iter().filter(|s| is_foreground(s)).collect(),
        TargetRef::UnmappedApps => sessions
            .iter()
            .filter(|s| !bindings.is_explicitly_bound(&s.process_name) && !is_foreground(s))
            .collect(),
    };

    trace!("{} -> {} sessions", target, matched.len());
    matched
}
