//! Container orchestration API
//!
//! The pod backend only needs four calls against a single namespace. They
//! sit behind [`PodApi`] so the lifecycle logic can be exercised without a
//! cluster; [`KubePodApi`] is the Kubernetes implementation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, LogParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client};
use std::fmt;
use tracing::{debug, info};

use crate::error::PodError;

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Succeeded and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod operations used by the pod backend
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Creates the pod and returns its name
    async fn create(&self, pod: &Pod) -> Result<String, PodError>;

    /// Reads the pod's current phase
    async fn phase(&self, name: &str) -> Result<PodPhase, PodError>;

    /// Reads the pod's container logs
    async fn logs(&self, name: &str) -> Result<String, PodError>;

    /// Deletes the pod; [`PodError::NotFound`] if it does not exist
    async fn delete(&self, name: &str) -> Result<(), PodError>;
}

/// Kubernetes implementation of [`PodApi`]
#[derive(Clone)]
pub struct KubePodApi {
    api: Api<Pod>,
}

impl KubePodApi {
    /// Connects using a named kubeconfig context, or the inferred
    /// configuration (in-cluster service account, then default kubeconfig)
    pub async fn connect(namespace: &str, context: Option<&str>) -> Result<Self, PodError> {
        let config = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                kube::Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| PodError::Config(e.to_string()))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| PodError::Config(e.to_string()))?,
        };

        let client = Client::try_from(config)?;
        info!(
            "Connected to Kubernetes (namespace: {}, context: {})",
            namespace,
            context.unwrap_or("inferred")
        );

        Ok(Self {
            api: Api::namespaced(client, namespace),
        })
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create(&self, pod: &Pod) -> Result<String, PodError> {
        let created = self.api.create(&PostParams::default(), pod).await?;
        created
            .metadata
            .name
            .ok_or_else(|| PodError::Unnamed(format!("{:?}", pod.metadata.name)))
    }

    async fn phase(&self, name: &str) -> Result<PodPhase, PodError> {
        let pod = match self.api.get(name).await {
            Ok(pod) => pod,
            Err(e) if is_not_found(&e) => return Err(PodError::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        let phase = pod
            .status
            .and_then(|status| status.phase)
            .map(|phase| PodPhase::parse(&phase))
            .unwrap_or(PodPhase::Pending);
        debug!("Pod {} is {}", name, phase);
        Ok(phase)
    }

    async fn logs(&self, name: &str) -> Result<String, PodError> {
        Ok(self.api.logs(name, &LogParams::default()).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), PodError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(PodError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parsing() {
        assert_eq!(PodPhase::parse("Succeeded"), PodPhase::Succeeded);
        assert_eq!(PodPhase::parse("Failed"), PodPhase::Failed);
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
    }

    #[test]
    fn test_only_succeeded_and_failed_are_terminal() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Pending.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(!PodPhase::Unknown.is_terminal());
    }
}
