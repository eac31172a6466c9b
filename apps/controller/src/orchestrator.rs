use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Terminal server port exposed by every runner pod.
pub const TERMINAL_PORT: u16 = 7681;

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_name: String,
    pub session_id: String,
    pub code_url: String,
    pub code_checksum: Option<String>,
    pub command: String,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PodObservation {
    pub pod_name: String,
    pub pod_ip: Option<String>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Api(String),
    #[error("pod ip not observed within deadline")]
    DiscoveryTimeout,
}

/// Job submission and pod observation, abstracted so tests can run without
/// a control plane.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError>;
    async fn list_pods(&self, job_name: &str) -> Result<Vec<PodObservation>, OrchestratorError>;
}

/// Observe the job's pods until the first non-empty pod ip appears.
///
/// Polling is jittered (500ms-1.5s) and bounded by `deadline`. When several
/// pods report an ip in the same observation, the lexicographically smallest
/// pod name wins, so retries settle on the same pod.
pub async fn await_pod_ip(
    orchestrator: &dyn Orchestrator,
    job_name: &str,
    deadline: Duration,
) -> Result<(String, String), OrchestratorError> {
    let started = Instant::now();
    loop {
        let pods = orchestrator.list_pods(job_name).await?;
        let mut ready: Vec<(String, String)> = pods
            .into_iter()
            .filter_map(|pod| {
                pod.pod_ip
                    .filter(|ip| !ip.is_empty())
                    .map(|ip| (pod.pod_name, ip))
            })
            .collect();
        ready.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some((pod_name, pod_ip)) = ready.into_iter().next() {
            debug!(job_name, %pod_name, %pod_ip, "pod ip observed");
            return Ok((pod_name, pod_ip));
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(OrchestratorError::DiscoveryTimeout);
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(500..=1500));
        tokio::time::sleep(jitter.min(remaining)).await;
    }
}

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub namespace: String,
    pub runner_image: String,
    pub job_ttl_seconds: u64,
    pub job_active_deadline_seconds: u64,
}

/// Kubernetes Jobs/Pods REST client. Runs with the mounted service-account
/// credentials in-cluster, or a plain base url for dev.
pub struct KubeOrchestrator {
    client: reqwest::Client,
    config: KubeConfig,
}

impl KubeOrchestrator {
    pub fn new(config: KubeConfig) -> Result<Self, OrchestratorError> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca_pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca_pem)
                .map_err(|err| OrchestratorError::Api(format!("bad ca certificate: {err}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|err| OrchestratorError::Api(err.to_string()))?;
        Ok(Self { client, config })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn job_manifest(&self, spec: &JobSpec) -> serde_json::Value {
        // The command travels as a plain env value; the runner boot contract
        // receives it verbatim and no shell expands it in between.
        let mut env = vec![
            json!({"name": "WSCLI_CODE_URL", "value": spec.code_url}),
            json!({"name": "WSCLI_COMMAND", "value": spec.command}),
        ];
        if let Some(checksum) = &spec.code_checksum {
            env.push(json!({"name": "WSCLI_CODE_CHECKSUM", "value": checksum}));
        }
        if let Some(prompt) = &spec.prompt {
            env.push(json!({"name": "WSCLI_PROMPT", "value": prompt}));
        }

        let labels = json!({
            "app": "wscli-runner",
            "wscli-session": spec.session_id,
        });

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": spec.job_name,
                "labels": labels.clone(),
            },
            "spec": {
                "ttlSecondsAfterFinished": self.config.job_ttl_seconds,
                "activeDeadlineSeconds": self.config.job_active_deadline_seconds,
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "runner",
                            "image": self.config.runner_image,
                            "ports": [{ "containerPort": TERMINAL_PORT }],
                            "env": env,
                        }],
                    },
                },
            },
        })
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError> {
        let url = format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.config.api_url.trim_end_matches('/'),
            self.config.namespace
        );
        let response = self
            .authorize(self.client.post(&url))
            .json(&self.job_manifest(spec))
            .send()
            .await
            .map_err(|err| OrchestratorError::Api(err.to_string()))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Api(format!(
                "job submit returned {}",
                response.status()
            )));
        }
        debug!(job_name = %spec.job_name, "job submitted");
        Ok(())
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<PodObservation>, OrchestratorError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods",
            self.config.api_url.trim_end_matches('/'),
            self.config.namespace
        );
        let response = self
            .authorize(self.client.get(&url))
            .query(&[("labelSelector", format!("job-name={job_name}"))])
            .send()
            .await
            .map_err(|err| OrchestratorError::Api(err.to_string()))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Api(format!(
                "pod list returned {}",
                response.status()
            )));
        }

        let list: PodList = response
            .json()
            .await
            .map_err(|err| OrchestratorError::Api(err.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .map(|item| PodObservation {
                pod_name: item.metadata.name,
                pod_ip: item.status.pod_ip,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
struct PodItem {
    metadata: PodMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
}

/// Orchestrator double for tests and store-only dev runs: records submitted
/// jobs and reports whatever pods were planted.
#[derive(Default)]
pub struct InMemoryOrchestrator {
    jobs: Mutex<Vec<JobSpec>>,
    pods: Mutex<HashMap<String, Vec<PodObservation>>>,
    auto_pod_ip: Option<String>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submitted job immediately reports one pod with this ip.
    pub fn with_auto_pod_ip(ip: &str) -> Self {
        Self {
            auto_pod_ip: Some(ip.to_string()),
            ..Self::default()
        }
    }

    pub async fn submitted_jobs(&self) -> Vec<JobSpec> {
        self.jobs.lock().await.clone()
    }

    pub async fn set_pods(&self, job_name: &str, pods: Vec<PodObservation>) {
        self.pods.lock().await.insert(job_name.to_string(), pods);
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn create_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError> {
        if let Some(ip) = &self.auto_pod_ip {
            self.pods.lock().await.insert(
                spec.job_name.clone(),
                vec![PodObservation {
                    pod_name: format!("{}-pod", spec.job_name),
                    pod_ip: Some(ip.clone()),
                }],
            );
        }
        self.jobs.lock().await.push(spec.clone());
        Ok(())
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<PodObservation>, OrchestratorError> {
        Ok(self
            .pods
            .lock()
            .await
            .get(job_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_picks_lexicographically_first_pod() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator
            .set_pods(
                "wscli-abc",
                vec![
                    PodObservation {
                        pod_name: "wscli-abc-zzz".into(),
                        pod_ip: Some("10.0.0.9".into()),
                    },
                    PodObservation {
                        pod_name: "wscli-abc-aaa".into(),
                        pod_ip: Some("10.0.0.5".into()),
                    },
                ],
            )
            .await;

        let (pod_name, pod_ip) =
            await_pod_ip(&orchestrator, "wscli-abc", Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(pod_name, "wscli-abc-aaa");
        assert_eq!(pod_ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn pods_without_ip_are_skipped() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator
            .set_pods(
                "wscli-abc",
                vec![
                    PodObservation {
                        pod_name: "wscli-abc-aaa".into(),
                        pod_ip: None,
                    },
                    PodObservation {
                        pod_name: "wscli-abc-bbb".into(),
                        pod_ip: Some("10.0.0.7".into()),
                    },
                ],
            )
            .await;

        let (pod_name, pod_ip) =
            await_pod_ip(&orchestrator, "wscli-abc", Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(pod_name, "wscli-abc-bbb");
        assert_eq!(pod_ip, "10.0.0.7");
    }

    #[tokio::test]
    async fn discovery_times_out_when_no_pod_appears() {
        let orchestrator = InMemoryOrchestrator::new();
        let err = await_pod_ip(&orchestrator, "wscli-abc", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DiscoveryTimeout));
    }

    #[test]
    fn job_manifest_carries_command_as_env_value() {
        let orchestrator = KubeOrchestrator::new(KubeConfig {
            api_url: "https://kubernetes.default.svc".into(),
            token: None,
            ca_pem: None,
            namespace: "ws-cli".into(),
            runner_image: "wscli-runner:latest".into(),
            job_ttl_seconds: 300,
            job_active_deadline_seconds: 3600,
        })
        .unwrap();

        let manifest = orchestrator.job_manifest(&JobSpec {
            job_name: "wscli-11111111-111".into(),
            session_id: "11111111-1111-4111-8111-111111111111".into(),
            code_url: "https://github.com/x/y.git".into(),
            code_checksum: None,
            command: "npm test".into(),
            prompt: None,
        });

        assert_eq!(manifest["metadata"]["name"], "wscli-11111111-111");
        assert_eq!(
            manifest["spec"]["template"]["spec"]["restartPolicy"],
            "Never"
        );
        let env = manifest["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap();
        assert!(env
            .iter()
            .any(|e| e["name"] == "WSCLI_COMMAND" && e["value"] == "npm test"));
        assert!(env.iter().all(|e| e["name"] != "WSCLI_PROMPT"));
    }
}
