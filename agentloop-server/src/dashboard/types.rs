//! Response bodies of the dashboard API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactRecord;
use crate::queue::Job;
use crate::store::{CiSnapshot, PrEventRecord, PrRecord};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: String,
    pub store: &'static str,
}

/// `?status=&limit=` on the job list.
#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobsApiResponse {
    pub version: String,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    pub artifacts: Vec<ArtifactRecord>,
}

#[derive(Debug, Serialize)]
pub struct PrsApiResponse {
    pub version: String,
    pub prs: Vec<PrRecord>,
}

#[derive(Debug, Serialize)]
pub struct PrDetailResponse {
    pub pr: PrRecord,
    pub ci_snapshots: Vec<CiSnapshot>,
    pub events: Vec<PrEventRecord>,
}

/// Everything the overview page shows.
#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub version: String,
    /// Job counts keyed by status name.
    pub jobs_by_status: BTreeMap<String, u64>,
    pub recent_failures: Vec<Job>,
    pub prs: Vec<PrRecord>,
}
