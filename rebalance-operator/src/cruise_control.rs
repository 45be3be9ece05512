use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::metrics_consts::ENGINE_CALLS_COUNTER;
use crate::rebalance::engine::{
    EngineConnector, EngineHandle, JobPhase, JobStatus, MembersInUseChecker, OptimizationEngine,
    ProposalPhase, ProposalRequest, ProposalResponse,
};
use crate::types::{MemberId, OptimizationSpec, RebalanceMode};

const API_PREFIX: &str = "kafkacruisecontrol";
pub const USER_TASK_ID_HEADER: &str = "User-Task-ID";

const NOT_ENOUGH_WINDOWS: &str = "NotEnoughValidWindowsException";
const HARD_GOAL_MARKERS: [&str; 2] = ["skip_hard_goal_check", "hard goals"];

/// Client for a Cruise-Control-style REST API.
#[derive(Clone)]
pub struct CruiseControlClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserTasksBody {
    #[serde(rename = "userTasks", default)]
    user_tasks: Vec<UserTask>,
}

#[derive(Debug, Deserialize)]
struct UserTask {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "originalResponse", default)]
    original_response: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ClusterStateBody {
    #[serde(rename = "KafkaBrokerState")]
    broker_state: BrokerState,
}

#[derive(Debug, Deserialize)]
struct BrokerState {
    #[serde(rename = "ReplicaCountByBrokerId", default)]
    replica_count_by_broker_id: BTreeMap<String, i64>,
}

impl CruiseControlClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Engine(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{API_PREFIX}/{endpoint}", self.base_url)
    }

    async fn send(&self, call: &'static str, builder: RequestBuilder) -> Result<Response> {
        match builder.send().await {
            Ok(response) => {
                counter!(ENGINE_CALLS_COUNTER, "call" => call, "outcome" => "sent").increment(1);
                Ok(response)
            }
            Err(e) => {
                counter!(ENGINE_CALLS_COUNTER, "call" => call, "outcome" => "transport_error")
                    .increment(1);
                Err(Error::Engine(format!("{call} request failed: {e}")))
            }
        }
    }
}

fn endpoint_for(mode: RebalanceMode) -> &'static str {
    match mode {
        RebalanceMode::Full => "rebalance",
        RebalanceMode::AddMembers => "add_broker",
        RebalanceMode::RemoveMembers => "remove_broker",
    }
}

/// Query parameters for a proposal submission.
pub fn proposal_query(request: &ProposalRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("json", "true".to_string()),
        ("dryrun", request.dry_run.to_string()),
    ];
    if request.mode != RebalanceMode::Full {
        query.push(("brokerid", join(&request.target_members)));
    }
    if let Some(goals) = &request.goals {
        query.push(("goals", goals.join(",")));
    }
    if request.skip_hard_goal_check {
        query.push(("skip_hard_goal_check", "true".to_string()));
    }
    let options = &request.options;
    if let Some(topics) = &options.excluded_topics {
        query.push(("excluded_topics", topics.clone()));
    }
    if let Some(movements) = options.concurrent_partition_movements_per_member {
        query.push((
            "concurrent_partition_movements_per_broker",
            movements.to_string(),
        ));
    }
    if let Some(throttle) = options.replication_throttle {
        query.push(("replication_throttle", throttle.to_string()));
    }
    query
}

fn join(ids: &[MemberId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn user_task_id(response: &Response) -> Option<String> {
    response
        .headers()
        .get(USER_TASK_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The plan summary if the engine sent one, otherwise the whole body.
fn optimization_result(body: Value) -> Value {
    match body.get("summary") {
        Some(summary) => summary.clone(),
        None => body,
    }
}

/// Classify an error body returned for a proposal submission.
pub fn classify_error(status: StatusCode, body: &str) -> Result<ProposalResponse> {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error_message)
        .unwrap_or_else(|| body.to_string());

    if message.contains(NOT_ENOUGH_WINDOWS) {
        let mut response = ProposalResponse::new(ProposalPhase::InsufficientData);
        response.message = Some(message);
        return Ok(response);
    }
    if HARD_GOAL_MARKERS.iter().any(|m| message.contains(m)) {
        let mut response = ProposalResponse::new(ProposalPhase::BadGoals);
        response.message = Some(message);
        return Ok(response);
    }
    Err(Error::Engine(format!("engine returned {status}: {message}")))
}

/// Map a user task `Status` string to a job phase.
pub fn job_phase(status: &str) -> Result<JobPhase> {
    match status {
        "Active" => Ok(JobPhase::Active),
        "InExecution" => Ok(JobPhase::InExecution),
        "Completed" => Ok(JobPhase::Done),
        "CompletedWithError" => Ok(JobPhase::Error),
        other => Err(Error::Engine(format!("unknown user task status {other:?}"))),
    }
}

#[async_trait]
impl OptimizationEngine for CruiseControlClient {
    async fn submit_proposal(
        &self,
        request: &ProposalRequest,
        session_token: Option<&str>,
    ) -> Result<ProposalResponse> {
        let mut builder = self
            .client
            .post(self.url(endpoint_for(request.mode)))
            .query(&proposal_query(request));
        if let Some(token) = session_token {
            builder = builder.header(USER_TASK_ID_HEADER, token);
        }

        let response = self.send("submit_proposal", builder).await?;
        let status = response.status();
        let token = user_task_id(&response);

        match status {
            StatusCode::OK => {
                let body: Value = response.json().await?;
                Ok(ProposalResponse {
                    phase: ProposalPhase::Ready,
                    result: Some(optimization_result(body)),
                    session_token: token,
                    message: None,
                })
            }
            StatusCode::ACCEPTED => {
                let token = token.ok_or_else(|| {
                    Error::Engine("engine accepted proposal without a user task id".to_string())
                })?;
                Ok(ProposalResponse {
                    phase: ProposalPhase::Computing,
                    result: None,
                    session_token: Some(token),
                    message: None,
                })
            }
            _ => {
                let body = response.text().await?;
                classify_error(status, &body)
            }
        }
    }

    async fn poll_job(&self, session_token: &str) -> Result<JobStatus> {
        let builder = self.client.get(self.url("user_tasks")).query(&[
            ("json", "true"),
            ("user_task_ids", session_token),
            ("fetch_completed_task", "true"),
        ]);
        let response = self.send("poll_job", builder).await?;
        if !response.status().is_success() {
            return Err(Error::Engine(format!(
                "user_tasks returned {}",
                response.status()
            )));
        }

        let body: UserTasksBody = response.json().await?;
        let task = body.user_tasks.into_iter().next().ok_or_else(|| {
            Error::Engine(format!("engine does not know user task {session_token}"))
        })?;
        let phase = job_phase(&task.status)?;

        // Completed tasks carry the original response, usually as an encoded string.
        let result = match task.original_response {
            Some(Value::String(raw)) => serde_json::from_str(&raw).ok().map(optimization_result),
            Some(Value::Null) | None => None,
            Some(other) => Some(optimization_result(other)),
        };

        Ok(JobStatus {
            phase,
            message: (phase == JobPhase::Error)
                .then(|| format!("user task {session_token} completed with error")),
            result,
        })
    }

    async fn cancel_job(&self, session_token: &str) -> Result<()> {
        let builder = self
            .client
            .post(self.url("stop_proposal_execution"))
            .query(&[("json", "true")])
            .header(USER_TASK_ID_HEADER, session_token);
        let response = self.send("cancel_job", builder).await?;
        if !response.status().is_success() {
            return Err(Error::Engine(format!(
                "stop_proposal_execution returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MembersInUseChecker for CruiseControlClient {
    async fn members_in_use(&self, candidates: &BTreeSet<MemberId>) -> Result<BTreeSet<MemberId>> {
        let builder = self
            .client
            .get(self.url("kafka_cluster_state"))
            .query(&[("json", "true")]);
        let response = self.send("members_in_use", builder).await?;
        if !response.status().is_success() {
            return Err(Error::Engine(format!(
                "kafka_cluster_state returned {}",
                response.status()
            )));
        }

        let body: ClusterStateBody = response.json().await?;
        Ok(body
            .broker_state
            .replica_count_by_broker_id
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .filter_map(|(id, _)| id.parse::<MemberId>().ok())
            .filter(|id| candidates.contains(id))
            .collect())
    }
}

/// Connects to the engine named by each cluster's optimization endpoint.
pub struct HttpEngineConnector {
    timeout: Duration,
}

impl HttpEngineConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl EngineConnector for HttpEngineConnector {
    fn connect(&self, optimization: &OptimizationSpec) -> Result<EngineHandle> {
        let client = Arc::new(CruiseControlClient::new(&optimization.endpoint, self.timeout)?);
        Ok(EngineHandle {
            engine: client.clone(),
            in_use: client,
        })
    }
}
