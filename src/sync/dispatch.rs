//! Hardware to OS path

use super::{is_session_target, matching_sessions, needs_foreground, with_timeout, SyncEngine};
use crate::keys::KeyCode;
use crate::protocol::{ArduinoMessage, HostCommand};
use crate::resolver::TargetRef;
use crate::volume::{SessionHandle, VolumeDirectory, VolumeError};
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

/// Outcome of one dispatched frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub writes_ok: usize,
    pub writes_failed: usize,
    pub keys_pressed: Vec<KeyCode>,
}

/// One OS volume write
#[derive(Debug, Clone)]
enum WriteJob {
    MasterOutput(u8),
    MasterInput(u8),
    Session {
        handle: SessionHandle,
        process_name: String,
        percent: u8,
    },
}

impl WriteJob {
    async fn apply(&self, directory: &dyn VolumeDirectory) -> Result<(), VolumeError> {
        match self {
            WriteJob::MasterOutput(percent) => directory.set_master_output(*percent).await,
            WriteJob::MasterInput(percent) => directory.set_master_input(*percent).await,
            WriteJob::Session {
                handle, percent, ..
            } => directory.set_session_volume(*handle, *percent).await,
        }
    }
}

impl fmt::Display for WriteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteJob::MasterOutput(p) => write!(f, "master={}", p),
            WriteJob::MasterInput(p) => write!(f, "mic={}", p),
            WriteJob::Session {
                handle,
                process_name,
                percent,
            } => write!(f, "{}{}={}", process_name, handle, percent),
        }
    }
}

impl SyncEngine {
    /// Apply one hardware frame to the OS
    ///
    /// Slider values are clamped to 0-100 and recorded in the hardware cache
    /// before any write is attempted. Buttons fire on the released to pressed
    /// transition only.
    pub async fn dispatch(&self, msg: &ArduinoMessage) -> DispatchReport {
        let mut state = self.state.lock().await;
        let mut report = DispatchReport::default();

        for (&index, &pressed) in &msg.button_states {
            let was_pressed = state.buttons.insert(index, pressed).unwrap_or(false);
            if !pressed || was_pressed {
                continue;
            }
            let Some(key) = self.bindings.key_for(index) else {
                trace!("Button {} pressed, unbound", index);
                continue;
            };
            match self.keys.press(key) {
                Ok(()) => {
                    debug!("Button {} -> {}", index, key);
                    report.keys_pressed.push(key);
                }
                Err(e) => warn!("Button {} key injection failed: {:#}", index, e),
            }
        }

        if msg.slider_values.is_empty() {
            return report;
        }

        let targets = || {
            msg.slider_values
                .keys()
                .flat_map(|&index| self.bindings.targets_for(index).iter())
        };
        let sessions = if targets().any(is_session_target) {
            self.sessions().await
        } else {
            None
        };
        let foreground = if targets().any(needs_foreground) {
            self.current_foreground().await
        } else {
            None
        };

        let mut jobs = Vec::new();
        for (&index, &raw) in &msg.slider_values {
            let percent = raw.clamp(0, 100) as u8;
            state.hardware.set(index, percent);

            for target in self.bindings.targets_for(index) {
                match target {
                    TargetRef::Master => jobs.push(WriteJob::MasterOutput(percent)),
                    TargetRef::Microphone => jobs.push(WriteJob::MasterInput(percent)),
                    _ => {
                        let Some(sessions) = sessions.as_deref() else {
                            debug!("Slider {}: sessions unavailable, skipping {}", index, target);
                            continue;
                        };
                        if *target == TargetRef::CurrentForegroundApp && foreground.is_none() {
                            debug!("Slider {}: foreground unresolved, skipping", index);
                            continue;
                        }
                        let matched = matching_sessions(
                            target,
                            sessions,
                            foreground.as_deref(),
                            &self.bindings,
                        );
                        for session in matched {
                            jobs.push(WriteJob::Session {
                                handle: session.handle,
                                process_name: session.process_name.clone(),
                                percent,
                            });
                        }
                    }
                }
            }
        }

        let (ok, failed) = self.run_writes(jobs).await;
        report.writes_ok = ok;
        report.writes_failed = failed;

        // state guard released here, after every write has settled
        drop(state);
        report
    }

    /// Run writes concurrently up to the permit bound
    ///
    /// A failing write never affects its siblings.
    async fn run_writes(&self, jobs: Vec<WriteJob>) -> (usize, usize) {
        if jobs.is_empty() {
            return (0, 0);
        }

        let mut set = JoinSet::new();
        for job in jobs {
            let directory = Arc::clone(&self.directory);
            let permits = Arc::clone(&self.write_permits);
            let limit = self.options.volume_call_timeout;

            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = with_timeout(limit, job.apply(directory.as_ref())).await;
                (job, result)
            });
        }

        let (mut ok, mut failed) = (0, 0);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((job, Ok(()))) => {
                    trace!("Applied {}", job);
                    ok += 1;
                }
                Ok((job, Err(e))) if e.is_not_found() => {
                    debug!("Skipped {}: {}", job, e);
                    failed += 1;
                }
                Ok((job, Err(e))) => {
                    warn!("Volume write {} failed: {}", job, e);
                    failed += 1;
                }
                Err(e) => {
                    error!("Volume write task failed: {}", e);
                    failed += 1;
                }
            }
        }

        (ok, failed)
    }

    /// Move a slider from the host side
    ///
    /// Sends `SET` to the device, then applies the value as if the slider
    /// had been moved so the OS and the cache follow.
    pub async fn set_slider(&self, index: usize, percent: u8) -> Result<DispatchReport> {
        let percent = percent.min(100);
        self.device
            .send(&HostCommand::Set {
                slider: index,
                percent,
            })
            .with_context(|| format!("Failed to send SET for slider {}", index))?;

        let mut msg = ArduinoMessage::new();
        msg.slider_values.insert(index, i32::from(percent));
        Ok(self.dispatch(&msg).await)
    }
}
