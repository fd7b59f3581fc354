//! Foreground tracker
//!
//! Polls the focused process and, when it changes, lets sliders bound to
//! `deej.current` follow the new application straight away.

use crate::sync::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct ForegroundTracker {
    engine: Arc<SyncEngine>,
    poll_interval: Duration,
    last: Option<String>,
}

impl ForegroundTracker {
    pub fn new(engine: Arc<SyncEngine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
            last: None,
        }
    }

    /// Poll once; returns the new name when focus moved
    ///
    /// An unresolved focus keeps the previous application.
    pub async fn poll(&mut self) -> Option<String> {
        let current = self.engine.current_foreground().await?;
        if self
            .last
            .as_deref()
            .is_some_and(|last| last.eq_ignore_ascii_case(&current))
        {
            return None;
        }

        debug!("Focus moved to {}", current);
        self.last = Some(current.clone());

        let report = self.engine.reconcile_foreground(&current).await;
        if !report.sent.is_empty() {
            info!("🎯 {} focused, {} slider(s) updated", current, report.sent.len());
        }
        Some(current)
    }

    /// Run the poll loop until `stop` flips
    pub fn spawn(mut self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("Foreground tracker started ({:?} poll)", self.poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Foreground tracker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arduino::testing::RecordingSink;
    use crate::keys::ConsoleKeyInjector;
    use crate::protocol::HostCommand;
    use crate::resolver::{Bindings, SliderBinding, TargetRef};
    use crate::sync::SyncOptions;
    use crate::volume::MemoryVolumeDirectory;

    fn setup() -> (Arc<SyncEngine>, Arc<MemoryVolumeDirectory>, Arc<RecordingSink>) {
        let bindings = Bindings::new(
            vec![SliderBinding {
                index: 2,
                targets: vec![TargetRef::CurrentForegroundApp],
            }],
            vec![],
        );
        let mixer = Arc::new(MemoryVolumeDirectory::new());
        let device = Arc::new(RecordingSink::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(bindings),
            mixer.clone(),
            device.clone(),
            Arc::new(ConsoleKeyInjector::new()),
            SyncOptions::default(),
        ));
        (engine, mixer, device)
    }

    #[tokio::test]
    async fn test_poll_reports_changes_only() {
        let (engine, mixer, device) = setup();
        mixer.add_session("game.exe", 30);
        let mut tracker = ForegroundTracker::new(engine, Duration::from_millis(10));

        assert_eq!(tracker.poll().await, None);

        mixer.set_foreground(Some("game.exe"));
        assert_eq!(tracker.poll().await.as_deref(), Some("game.exe"));
        assert_eq!(tracker.poll().await, None);

        // unresolved focus keeps the last app
        mixer.set_foreground(None);
        assert_eq!(tracker.poll().await, None);

        assert_eq!(
            device.commands(),
            vec![HostCommand::Set {
                slider: 2,
                percent: 30
            }]
        );
    }

    #[tokio::test]
    async fn test_focus_change_pushes_without_tick() {
        let (engine, mixer, device) = setup();
        mixer.add_session("game.exe", 30);
        mixer.add_session("chrome.exe", 75);
        mixer.set_foreground(Some("game.exe"));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ForegroundTracker::new(engine, Duration::from_millis(10)).spawn(stop_rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        mixer.set_foreground(Some("chrome.exe"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("tracker stopped")
            .unwrap();

        assert_eq!(
            device.commands(),
            vec![
                HostCommand::Set { slider: 2, percent: 30 },
                HostCommand::Set { slider: 2, percent: 75 },
            ]
        );
    }
}
