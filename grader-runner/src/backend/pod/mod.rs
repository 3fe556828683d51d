//! Kubernetes pod backend
//!
//! Each job runs the converter in a short-lived pod that shares the job
//! directories through a volume. The pod is deleted once its terminal phase
//! is observed; if the job is cancelled or times out first, the drop guard
//! deletes it in the background.

mod api;
mod images;
mod monitor;
mod template;

pub use api::{KubePodApi, PodApi, PodPhase};
pub use images::ImageTable;
pub use monitor::PodLifecycleMonitor;
pub use template::{DataVolume, PodTemplate};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionOutput, ExecutionRequest, collect_output};
use crate::error::{ExecutionError, PodError};

pub struct ContainerPodBackend {
    api: Arc<dyn PodApi>,
    images: ImageTable,
    template: PodTemplate,
    poll_interval: Duration,
}

impl ContainerPodBackend {
    pub fn new(
        api: Arc<dyn PodApi>,
        images: ImageTable,
        template: PodTemplate,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            images,
            template,
            poll_interval,
        }
    }
}

#[async_trait]
impl ExecutionBackend for ContainerPodBackend {
    fn name(&self) -> &'static str {
        "pod"
    }

    async fn run(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput, ExecutionError> {
        let submission = request.submission;
        let image = self
            .images
            .resolve(&submission.assignment.lecture_code, submission.assignment.id);
        let name = pod_name(request, &Uuid::new_v4());
        let manifest = self.template.build(
            &name,
            &image,
            request.kind,
            submission.id,
            request.input,
            request.output,
        )?;

        // From here on the pod may exist, so every exit path must delete it
        let mut pod = PodHandle::new(self.api.clone(), name);
        info!("Creating pod {} with image {}", pod.name, image);

        if let Err(e) = self.api.create(&manifest).await {
            if let Err(cleanup) = pod.delete().await {
                warn!("Failed to clean up pod {}: {}", pod.name, cleanup);
            }
            return Err(e.into());
        }

        let mut monitor =
            PodLifecycleMonitor::start(self.api.clone(), pod.name.clone(), self.poll_interval);
        let phase = monitor.terminal_phase().await;
        monitor.stop_polling();

        let phase = match phase {
            Ok(phase) => phase,
            Err(e) => {
                if let Err(cleanup) = pod.delete().await {
                    warn!("Failed to clean up pod {}: {}", pod.name, cleanup);
                }
                return Err(e.into());
            }
        };

        let logs = match self.api.logs(&pod.name).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Failed to read logs of pod {}: {}", pod.name, e);
                String::new()
            }
        };
        pod.delete().await?;
        debug!("Pod {} finished with phase {}", pod.name, phase);

        match phase {
            PodPhase::Succeeded => collect_output(request.kind, request.output, logs).await,
            _ => Err(ExecutionError::PodFailed {
                pod: pod.name.clone(),
                logs,
            }),
        }
    }
}

/// Pod names must be valid DNS labels and unique per run
fn pod_name(request: ExecutionRequest<'_>, run: &Uuid) -> String {
    let suffix = run.simple().to_string();
    format!(
        "{}-{}-{}",
        request.kind.as_str(),
        request.submission.id,
        &suffix[..8]
    )
}

/// Deletes its pod at most once, from [`delete`](Self::delete) or on drop
struct PodHandle {
    api: Arc<dyn PodApi>,
    name: String,
    deleted: bool,
}

impl PodHandle {
    fn new(api: Arc<dyn PodApi>, name: String) -> Self {
        Self {
            api,
            name,
            deleted: false,
        }
    }

    async fn delete(&mut self) -> Result<(), PodError> {
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;
        match self.api.delete(&self.name).await {
            Ok(()) | Err(PodError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for PodHandle {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to delete abandoned pod {}", self.name);
            return;
        };

        let api = self.api.clone();
        let name = std::mem::take(&mut self.name);
        warn!("Deleting abandoned pod {}", name);
        runtime.spawn(async move {
            if let Err(e) = api.delete(&name).await {
                warn!("Failed to delete abandoned pod {}: {}", name, e);
            }
        });
    }
}
