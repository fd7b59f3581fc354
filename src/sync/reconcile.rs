//! OS to hardware path

use super::{
    is_session_target, matching_sessions, needs_foreground, with_timeout, SyncEngine, SyncState,
};
use crate::protocol::HostCommand;
use crate::resolver::TargetRef;
use crate::volume::{SessionState, VolumeError};
use tracing::{debug, trace, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `SET` commands delivered to the device
    pub sent: Vec<HostCommand>,
    /// Sliders whose targets disagreed
    pub ambiguous: Vec<usize>,
}

impl SyncEngine {
    /// One reconciliation pass over every bound slider
    ///
    /// Returns `None` without touching anything when a dispatch currently
    /// holds the state.
    pub async fn reconcile_tick(&self) -> Option<TickReport> {
        let Ok(mut state) = self.state.try_lock() else {
            trace!("Dispatch in progress, skipping reconcile tick");
            return None;
        };

        let sliders: Vec<(usize, Vec<TargetRef>)> = self
            .bindings
            .bound_sliders()
            .map(|b| (b.index, b.targets.clone()))
            .collect();

        Some(self.reconcile_sliders(&mut state, &sliders, None).await)
    }

    /// Re-evaluate sliders bound to the focused application
    ///
    /// Called when focus moves so the device follows without waiting for the
    /// next tick.
    pub async fn reconcile_foreground(&self, foreground: &str) -> TickReport {
        let mut state = self.state.lock().await;

        let sliders: Vec<(usize, Vec<TargetRef>)> = self
            .bindings
            .foreground_sliders()
            .into_iter()
            .map(|index| (index, self.bindings.targets_for(index).to_vec()))
            .collect();

        self.reconcile_sliders(&mut state, &sliders, Some(foreground))
            .await
    }

    async fn reconcile_sliders(
        &self,
        state: &mut SyncState,
        sliders: &[(usize, Vec<TargetRef>)],
        foreground_override: Option<&str>,
    ) -> TickReport {
        let mut report = TickReport::default();
        if sliders.is_empty() {
            return report;
        }

        let all_targets = || sliders.iter().flat_map(|(_, targets)| targets.iter());
        let sessions = if all_targets().any(is_session_target) {
            self.sessions().await
        } else {
            None
        };
        let foreground = match foreground_override {
            Some(name) => Some(name.to_string()),
            None if all_targets().any(needs_foreground) => self.current_foreground().await,
            None => None,
        };

        for (index, targets) in sliders {
            let index = *index;
            let mut values = Vec::new();
            let mut missing = false;
            for target in targets {
                match self
                    .read_target(index, target, sessions.as_deref(), foreground.as_deref())
                    .await
                {
                    TargetRead::Values(read) => values.extend(read),
                    TargetRead::Missing => missing = true,
                    TargetRead::Unresolved => {}
                }
            }

            if missing {
                if targets.len() > 1 {
                    debug!("Slider {}: a target has no volume, leaving as is", index);
                    report.ambiguous.push(index);
                } else {
                    trace!("Slider {}: target has no volume", index);
                }
                continue;
            }
            let Some(&first) = values.first() else {
                trace!("Slider {}: no target resolved", index);
                continue;
            };
            if values.iter().any(|&v| v != first) {
                debug!("Slider {}: targets disagree {:?}, leaving as is", index, values);
                report.ambiguous.push(index);
                continue;
            }
            if state.hardware.get(index) == Some(first) {
                continue;
            }

            let command = HostCommand::Set {
                slider: index,
                percent: first,
            };
            match self.device.send(&command) {
                Ok(()) => {
                    debug!("Slider {} follows OS volume {}", index, first);
                    state.hardware.set(index, first);
                    report.sent.push(command);
                }
                Err(e) => warn!("Failed to send {}: {:#}", command, e),
            }
        }

        report
    }

    /// Current volume(s) behind one target
    async fn read_target(
        &self,
        index: usize,
        target: &TargetRef,
        sessions: Option<&[SessionState]>,
        foreground: Option<&str>,
    ) -> TargetRead {
        let limit = self.options.volume_call_timeout;

        match target {
            TargetRef::Master => {
                let read = with_timeout(limit, self.directory.get_master_output()).await;
                TargetRead::from_endpoint(index, target, read)
            }
            TargetRef::Microphone => {
                let read = with_timeout(limit, self.directory.get_master_input()).await;
                TargetRead::from_endpoint(index, target, read)
            }
            _ => {
                let Some(sessions) = sessions else {
                    return TargetRead::Missing;
                };
                if *target == TargetRef::CurrentForegroundApp && foreground.is_none() {
                    return TargetRead::Unresolved;
                }

                let matched = matching_sessions(target, sessions, foreground, &self.bindings);
                if matched.is_empty() {
                    // nothing unmapped is playing
                    if *target == TargetRef::UnmappedApps {
                        return TargetRead::Unresolved;
                    }
                    trace!("Slider {}: {} has no session", index, target);
                    return TargetRead::Missing;
                }

                let mut values = Vec::with_capacity(matched.len());
                for session in matched {
                    let read =
                        with_timeout(limit, self.directory.get_session_volume(session.handle))
                            .await;
                    match read {
                        Ok(value) => values.push(value),
                        Err(e) => {
                            debug!("Slider {}: reading {} failed: {}", index, target, e);
                            return TargetRead::Missing;
                        }
                    }
                }
                TargetRead::Values(values)
            }
        }
    }
}

/// What one target contributed to a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetRead {
    Values(Vec<u8>),
    /// Expected to exist but has no readable volume
    Missing,
    /// Nothing to compare right now (unresolved focus, no unmapped sessions)
    Unresolved,
}

impl TargetRead {
    fn from_endpoint(index: usize, target: &TargetRef, read: Result<u8, VolumeError>) -> Self {
        match read {
            Ok(value) => TargetRead::Values(vec![value]),
            Err(e) if e.is_not_found() => {
                trace!("Slider {}: {} not found", index, target);
                TargetRead::Missing
            }
            Err(e) => {
                debug!("Slider {}: reading {} failed: {}", index, target, e);
                TargetRead::Missing
            }
        }
    }
}
