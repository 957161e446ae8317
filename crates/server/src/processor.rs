// HTTP client for the processing collaborator
//
// The queue layer never runs business logic itself; each locked job is posted
// to the collaborator service and its verdict is mapped onto the dispatch
// outcome the worker settles.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conveyor_queue::{JobPayload, JobProcessor, LockedJob, NewJob, ProcessOutcome};

/// Dispatches jobs to the collaborator's `/v1/dispatch` endpoint
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    job_id: uuid::Uuid,
    batch_id: &'a str,
    attempt: u32,
    payload: &'a JobPayload,
}

/// Collaborator verdict for one job
#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum DispatchVerdict {
    Ok,
    /// The job's input is not there yet; `dependency` is the payload the
    /// collaborator wants enqueued first
    MissingPrerequisite { dependency: JobPayload },
    Failed { error: String },
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl JobProcessor for HttpCollaborator {
    async fn process(&self, job: &LockedJob) -> ProcessOutcome {
        let url = format!("{}/v1/dispatch", self.base_url);
        let request = DispatchRequest {
            job_id: job.id,
            batch_id: &job.batch_id,
            attempt: job.retry_count + 1,
            payload: &job.payload,
        };

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(job_id = %job.id, "collaborator unreachable: {}", e);
                return ProcessOutcome::Failure(format!("collaborator unreachable: {e}"));
            }
        };

        let status = response.status();
        if status == StatusCode::OK {
            let verdict: DispatchVerdict = match response.json().await {
                Ok(verdict) => verdict,
                Err(e) => {
                    return ProcessOutcome::Failure(format!("undecodable collaborator reply: {e}"))
                }
            };
            match verdict {
                DispatchVerdict::Ok => {
                    debug!(job_id = %job.id, "collaborator accepted job");
                    ProcessOutcome::Success
                }
                DispatchVerdict::MissingPrerequisite { dependency } => {
                    ProcessOutcome::MissingPrerequisite {
                        dependency: NewJob::new(&job.batch_id, dependency),
                    }
                }
                DispatchVerdict::Failed { error } => ProcessOutcome::Failure(error),
            }
        } else {
            let body = response.text().await.unwrap_or_default();
            ProcessOutcome::Failure(format!("collaborator returned {status}: {body}"))
        }
    }
}
