//! Pod manifest for a single converter run
//!
//! Job directories live under a host data directory. The same directory is
//! mounted into the pod, so host paths are rewritten relative to the mount.

use grader_core::domain::job::JobKind;
use grader_core::domain::submission::SubmissionId;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backend::converter_args;
use crate::error::PodError;

const VOLUME_NAME: &str = "grader-data";
const CONTAINER_NAME: &str = "convert";

/// Where the job directories come from inside the pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataVolume {
    /// A persistent volume claim holding the data directory
    Claim(String),
    /// The data directory of the node itself
    HostPath,
}

#[derive(Debug, Clone)]
pub struct PodTemplate {
    pub namespace: String,
    pub converter: String,
    pub volume: DataVolume,
    /// Host directory containing every job's input and output trees
    pub data_dir: PathBuf,
    /// Where `data_dir` is mounted in the container
    pub mount_path: PathBuf,
}

impl PodTemplate {
    /// Rewrites a host path under the data directory to its in-pod path
    pub fn pod_path(&self, host: &Path) -> Result<PathBuf, PodError> {
        let relative = host.strip_prefix(&self.data_dir).map_err(|_| {
            PodError::Config(format!(
                "{} is outside the shared data directory {}",
                host.display(),
                self.data_dir.display()
            ))
        })?;
        Ok(self.mount_path.join(relative))
    }

    /// Builds the manifest of the pod running `kind` for `submission`
    pub fn build(
        &self,
        name: &str,
        image: &str,
        kind: JobKind,
        submission: SubmissionId,
        input: &Path,
        output: &Path,
    ) -> Result<Pod, PodError> {
        let mut command = vec![self.converter.clone()];
        command.extend(converter_args(
            kind,
            &self.pod_path(input)?,
            &self.pod_path(output)?,
        ));

        let labels = BTreeMap::from([
            ("app".to_string(), "grader".to_string()),
            ("grader/job-kind".to_string(), kind.as_str().to_string()),
            ("grader/submission".to_string(), submission.to_string()),
        ]);

        let volume = match &self.volume {
            DataVolume::Claim(claim) => Volume {
                name: VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
            DataVolume::HostPath => Volume {
                name: VOLUME_NAME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: self.data_dir.to_string_lossy().into_owned(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            },
        };

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(image.to_string()),
            command: Some(command),
            volume_mounts: Some(vec![VolumeMount {
                name: VOLUME_NAME.to_string(),
                mount_path: self.mount_path.to_string_lossy().into_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(vec![volume]),
                restart_policy: Some("Never".to_string()),
                automount_service_account_token: Some(false),
                ..Default::default()
            }),
            status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(volume: DataVolume) -> PodTemplate {
        PodTemplate {
            namespace: "grading".into(),
            converter: "grader-convert".into(),
            volume,
            data_dir: PathBuf::from("/srv/grader"),
            mount_path: PathBuf::from("/var/lib/grader"),
        }
    }

    #[test]
    fn test_pod_path_rewrites_under_mount() {
        let t = template(DataVolume::HostPath);
        assert_eq!(
            t.pod_path(Path::new("/srv/grader/in/submission_4")).unwrap(),
            PathBuf::from("/var/lib/grader/in/submission_4")
        );
        assert!(t.pod_path(Path::new("/tmp/elsewhere")).is_err());
    }

    #[test]
    fn test_build_grading_pod() {
        let t = template(DataVolume::Claim("grader-pvc".into()));
        let pod = t
            .build(
                "autograde-4-x",
                "reg/ds:1",
                JobKind::Autograde,
                4,
                Path::new("/srv/grader/in/submission_4"),
                Path::new("/srv/grader/out/submission_4"),
            )
            .unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("autograde-4-x"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("reg/ds:1"));
        let command = container.command.as_ref().unwrap();
        assert_eq!(command[0], "grader-convert");
        assert_eq!(command[1], "autograde");
        assert_eq!(command[3], "/var/lib/grader/in/submission_4");
        assert_eq!(command[5], "/var/lib/grader/out/submission_4");

        let volumes = spec.volumes.unwrap();
        let claim = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(claim.claim_name, "grader-pvc");
        assert!(volumes[0].host_path.is_none());
    }

    #[test]
    fn test_build_rejects_paths_outside_data_dir() {
        let t = template(DataVolume::HostPath);
        let result = t.build(
            "p",
            "img",
            JobKind::Feedback,
            1,
            Path::new("/tmp/in"),
            Path::new("/srv/grader/out"),
        );
        assert!(matches!(result, Err(PodError::Config(_))));
    }
}
