//! Execution agent backed by Kubernetes Jobs.
//!
//! Each Backup or Restore gets one `batch/v1` Job running the restic agent
//! image. The agent annotates its own Job with the snapshot identifier before
//! exiting successfully; the operator reads signals back from Job status.
//!
//! Job names are bounded to 63 characters. Longer record names are cut and
//! suffixed with a digest of the full name, and the full name is kept in the
//! `backups.shepherd/record` annotation, which `poll` checks before trusting
//! a Job's status.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecretEnvSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{AgentEvent, AgentSignal, ExecutionAgent, JobKind, JobRequest};
use crate::config::AgentConfig;
use crate::crd::{MANAGED_BY_LABEL, MANAGER_NAME, SITE_LABEL};
use crate::error::{Error, Result};

/// Annotation the agent writes on its Job with the snapshot identifier.
pub const RESTIC_ID_ANNOTATION: &str = "backups.shepherd/restic-id";

/// Annotation naming the record a Job runs for.
pub const RECORD_ANNOTATION: &str = "backups.shepherd/record";

const KIND_LABEL: &str = "backups.shepherd/kind";
const MAX_NAME_LEN: usize = 63;
const NAME_DIGEST_LEN: usize = 10;

/// Agent that launches one Kubernetes Job per record
pub struct JobAgent {
    client: Client,
    config: AgentConfig,
}

impl JobAgent {
    pub fn new(client: Client, config: AgentConfig) -> Self {
        Self { client, config }
    }
}

fn build_job(config: &AgentConfig, request: &JobRequest) -> Job {
    let name = job_name(request.kind, &request.name);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels.insert(KIND_LABEL.to_string(), request.kind.as_str().to_string());
    if let Some(site) = &request.site {
        labels.insert(SITE_LABEL.to_string(), site.clone());
    }

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (volume_name, target) in &request.volumes {
        let vol = format!("volume-{}", volume_name);
        volumes.push(Volume {
            name: vol.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: target.claim_name.clone(),
                read_only: Some(request.kind == JobKind::Backup),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: vol,
            mount_path: format!("/volumes/{}", volume_name),
            ..Default::default()
        });
    }

    let env_from = request
        .mysql
        .iter()
        .map(|(db_name, target)| EnvFromSource {
            prefix: Some(format!("MYSQL_{}_", db_name.to_uppercase().replace('-', "_"))),
            secret_ref: Some(SecretEnvSource {
                name: Some(target.secret.clone()),
                optional: Some(false),
            }),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut env = vec![
        EnvVar {
            name: "BACKUP_VOLUMES".to_string(),
            value: Some(request.volumes.keys().cloned().collect::<Vec<_>>().join(",")),
            ..Default::default()
        },
        EnvVar {
            name: "BACKUP_DATABASES".to_string(),
            value: Some(request.mysql.keys().cloned().collect::<Vec<_>>().join(",")),
            ..Default::default()
        },
        EnvVar {
            name: "JOB_NAME".to_string(),
            value: Some(name.clone()),
            ..Default::default()
        },
    ];
    if let Some(snapshot) = &request.snapshot_id {
        env.push(EnvVar {
            name: "RESTIC_ID".to_string(),
            value: Some(snapshot.clone()),
            ..Default::default()
        });
    }

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                RECORD_ANNOTATION.to_string(),
                request.name.clone(),
            )])),
            owner_references: request.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(config.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: config.service_account.clone(),
                    containers: vec![Container {
                        name: "agent".to_string(),
                        image: Some(config.image.clone()),
                        args: Some(vec![request.kind.as_str().to_string()]),
                        env: Some(env),
                        env_from: Some(env_from),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ExecutionAgent for JobAgent {
    async fn submit(&self, request: &JobRequest) -> Result<()> {
        let job = build_job(&self.config, request);
        let api: Api<Job> = Api::namespaced(self.client.clone(), &request.namespace);

        match api.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(name = %request.name, kind = request.kind.as_str(), "Agent job created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %request.name, "Agent job already exists");
                Ok(())
            }
            Err(e) => Err(Error::Agent(format!(
                "creating {} job for {}: {}",
                request.kind.as_str(),
                request.name,
                e
            ))),
        }
    }

    async fn poll(&self, kind: JobKind, namespace: &str, name: &str) -> Result<Vec<AgentSignal>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let job = api
            .get_opt(&job_name(kind, name))
            .await
            .map_err(|e| Error::Agent(format!("reading job for {}: {}", name, e)))?;

        match job {
            Some(job) => signals_for_record(name, &job),
            None => Ok(Vec::new()),
        }
    }
}

/// Name of the Job that runs a record; deterministic so resubmission is idempotent.
pub fn job_name(kind: JobKind, record: &str) -> String {
    let name = format!("{}-{}", kind.as_str(), record);
    if name.len() <= MAX_NAME_LEN {
        return name;
    }

    let mut hasher = Sha256::new();
    hasher.update(record.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let mut prefix = name;
    prefix.truncate(MAX_NAME_LEN - NAME_DIGEST_LEN - 1);
    while prefix.ends_with('-') || prefix.ends_with('.') {
        prefix.pop();
    }
    format!("{}-{}", prefix, &digest[..NAME_DIGEST_LEN])
}

/// Record a Job was created for, from its annotation.
pub fn job_record(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(RECORD_ANNOTATION))
        .map(String::as_str)
}

/// Signals from a Job, refusing Jobs created for a different record.
pub fn signals_for_record(record: &str, job: &Job) -> Result<Vec<AgentSignal>> {
    match job_record(job) {
        Some(owner) if owner == record => Ok(signals_from_job(record, job)),
        owner => Err(Error::Agent(format!(
            "job {} belongs to {}, not {}",
            job.metadata.name.as_deref().unwrap_or_default(),
            owner.unwrap_or("an unknown record"),
            record
        ))),
    }
}

/// Translate Job status into agent signals, oldest first.
pub fn signals_from_job(record: &str, job: &Job) -> Vec<AgentSignal> {
    let Some(status) = job.status.as_ref() else {
        return Vec::new();
    };
    let Some(started) = status.start_time.as_ref().map(|t| t.0) else {
        return Vec::new();
    };

    let mut signals = vec![AgentSignal::started(record, started)];

    let failed_condition = status.conditions.as_ref().and_then(|conds| {
        conds
            .iter()
            .find(|c| c.type_ == "Failed" && c.status == "True")
    });

    if status.succeeded.unwrap_or(0) > 0 {
        let finished = status.completion_time.as_ref().map(|t| t.0).unwrap_or(started);
        let snapshot = job
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(RESTIC_ID_ANNOTATION))
            .filter(|id| !id.is_empty())
            .cloned();
        // A missing annotation is passed through; the lifecycle rejects it
        signals.push(AgentSignal {
            job_id: record.to_string(),
            event: AgentEvent::Succeeded,
            timestamp: finished,
            snapshot_id: snapshot,
        });
    } else if let Some(cond) = failed_condition {
        let finished = cond
            .last_transition_time
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(started);
        signals.push(AgentSignal::failed(record, finished));
    }

    signals
}
