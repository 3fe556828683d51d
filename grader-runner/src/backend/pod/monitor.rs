//! Pod lifecycle monitor
//!
//! Polls a pod's phase on an interval until it reaches Succeeded or Failed.
//! The terminal phase is delivered through a oneshot, so it is observed at
//! most once no matter how the poller and the waiter interleave.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use super::api::{PodApi, PodPhase};
use crate::error::PodError;

pub struct PodLifecycleMonitor {
    pod: String,
    terminal: Option<oneshot::Receiver<Result<PodPhase, PodError>>>,
    task: JoinHandle<()>,
}

impl PodLifecycleMonitor {
    /// Starts polling `pod` every `interval`
    ///
    /// Transient API errors are logged and polling continues. A pod that has
    /// disappeared resolves the monitor with [`PodError::NotFound`].
    pub fn start(api: Arc<dyn PodApi>, pod: String, interval: Duration) -> Self {
        let (tx, rx) = oneshot::channel();
        let name = pod.clone();

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match api.phase(&name).await {
                    Ok(phase) if phase.is_terminal() => {
                        debug!("Pod {} reached {}", name, phase);
                        let _ = tx.send(Ok(phase));
                        return;
                    }
                    Ok(phase) => debug!("Pod {} still {}", name, phase),
                    Err(e @ PodError::NotFound(_)) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                    Err(e) => warn!("Failed to read phase of pod {}: {}", name, e),
                }
            }
        });

        Self {
            pod,
            terminal: Some(rx),
            task,
        }
    }

    /// Waits for the terminal phase
    ///
    /// Only the first call can observe it; later calls and calls after
    /// [`stop_polling`](Self::stop_polling) fail with
    /// [`PodError::MonitorStopped`].
    pub async fn terminal_phase(&mut self) -> Result<PodPhase, PodError> {
        let stopped = || PodError::MonitorStopped(self.pod.clone());
        match self.terminal.take() {
            Some(rx) => rx.await.map_err(|_| stopped())?,
            None => Err(stopped()),
        }
    }

    pub fn stop_polling(&self) {
        self.task.abort();
    }
}

impl Drop for PodLifecycleMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted [`PodApi`] shared by the pod backend tests
    #[derive(Default)]
    pub(crate) struct StubPodApi {
        pub phases: Mutex<VecDeque<PodPhase>>,
        pub polls: AtomicUsize,
        pub deletes: AtomicUsize,
        pub created: Mutex<Vec<Pod>>,
        pub reject_create: bool,
        pub logs: String,
    }

    impl StubPodApi {
        pub fn with_phases(phases: &[PodPhase]) -> Self {
            Self {
                phases: Mutex::new(phases.iter().copied().collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PodApi for StubPodApi {
        async fn create(&self, pod: &Pod) -> Result<String, PodError> {
            if self.reject_create {
                return Err(PodError::Config("quota exceeded".into()));
            }
            self.created.lock().unwrap().push(pod.clone());
            Ok(pod.metadata.name.clone().unwrap_or_default())
        }

        async fn phase(&self, _name: &str) -> Result<PodPhase, PodError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut phases = self.phases.lock().unwrap();
            // The last scripted phase sticks
            let phase = if phases.len() > 1 {
                phases.pop_front()
            } else {
                phases.front().copied()
            };
            Ok(phase.unwrap_or(PodPhase::Pending))
        }

        async fn logs(&self, _name: &str) -> Result<String, PodError> {
            Ok(self.logs.clone())
        }

        async fn delete(&self, name: &str) -> Result<(), PodError> {
            if self.deletes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(PodError::NotFound(name.to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolves_failed_after_second_poll() {
        let api = Arc::new(StubPodApi::with_phases(&[
            PodPhase::Pending,
            PodPhase::Failed,
        ]));
        let mut monitor =
            PodLifecycleMonitor::start(api.clone(), "p".into(), Duration::from_millis(10));

        assert_eq!(monitor.terminal_phase().await.unwrap(), PodPhase::Failed);
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            monitor.terminal_phase().await,
            Err(PodError::MonitorStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_polling_halts_the_poller() {
        let api = Arc::new(StubPodApi::with_phases(&[PodPhase::Running]));
        let mut monitor =
            PodLifecycleMonitor::start(api.clone(), "p".into(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop_polling();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let polls = api.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(polls > 0);
        assert_eq!(api.polls.load(Ordering::SeqCst), polls);
        assert!(matches!(
            monitor.terminal_phase().await,
            Err(PodError::MonitorStopped(_))
        ));
    }
}
