use crate::cleanup::CleanupReport;
use crate::fetcher::StopReason;
use crate::publisher::{PublishJob, PublishResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub message: &'static str,
    pub count: usize,
    pub data: Vec<Value>,
    pub skipped: Vec<crate::importer::SkippedUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountQuery {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub total_listings: usize,
    pub status: String,
    pub stop_reason: StopReason,
    pub failed_pages: usize,
    pub abandoned_pages: usize,
}

#[derive(Debug, Serialize)]
pub struct UrlListResponse {
    pub count: usize,
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub delete_threshold: f64,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub message: &'static str,
    pub results: CleanupReport,
}

/// A listing body plus the credentials to post it with.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub time_between_listings: u64,
    #[serde(flatten)]
    pub job: PublishJob,
}

fn default_interval_secs() -> u64 {
    60
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub message: &'static str,
    pub status: &'static str,
    #[serde(flatten)]
    pub result: PublishResult,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Single,
    RoundRobin,
    #[default]
    Shuffled,
}

#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default = "default_interval_secs")]
    pub time_between_listings: u64,
    #[serde(default)]
    pub jobs: Vec<PublishJob>,
}

#[derive(Debug, Serialize)]
pub struct TaskStarted {
    pub task_id: String,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct GlobalStopQuery {
    #[serde(default)]
    pub global_stop: bool,
}

#[derive(Debug, Serialize)]
pub struct GlobalStopResponse {
    pub message: &'static str,
    pub stopped_tasks: Vec<String>,
}
