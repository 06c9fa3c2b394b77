use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::RetryPolicy;

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    /// Secrets accepted on `/webhook`. The first is the code app's; a
    /// reviewer app secret may follow.
    pub webhook_secrets: Vec<String>,
    pub github_api_base: String,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub llm_max_tokens: u32,
    pub agent_max_steps: u32,
    pub agent_max_tool_output_chars: usize,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Scratch clones used by code-gen and fix jobs.
    pub workdir_root: PathBuf,
    pub max_iterations: u32,
    pub max_attempts: u32,
    pub lease_duration: Duration,
    /// Always strictly below `lease_duration`.
    pub job_timeout: Duration,
    pub reap_interval: Duration,
    pub retry_backoff: Duration,
    pub worker_poll_interval: Duration,
    pub delivery_retention: Duration,
    /// Empty means every reported check counts.
    pub required_checks: Vec<String>,
    /// Unset means only newly opened issues trigger code generation.
    pub trigger_label: Option<String>,
    pub git_user_name: String,
    pub git_user_email: String,
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", name)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let github_webhook_secret = parse_optional_token(env::var("GITHUB_WEBHOOK_SECRET").ok())
            .context("GITHUB_WEBHOOK_SECRET environment variable is required and must not be empty")?;
        let mut webhook_secrets = vec![github_webhook_secret];
        if let Some(reviewer_secret) = parse_optional_token(env::var("REVIEWER_WEBHOOK_SECRET").ok()) {
            webhook_secrets.push(reviewer_secret);
        }

        let github_api_base = env::var("GITHUB_API_BASE")
            .unwrap_or_else(|_| "https://api.github.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let llm_api_key =
            env::var("LLM_API_KEY").context("LLM_API_KEY environment variable is required")?;
        let llm_base_url = env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string())
            .trim_end_matches('/')
            .to_string();
        let llm_model = env::var("LLM_MODEL").context("LLM_MODEL environment variable is required")?;

        let port = var_or("PORT", 3000u16)?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let artifacts_dir = env::var("ARTIFACTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("artifacts"));
        let workdir_root = env::var("WORKDIR_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("workdir"));

        let lease_duration = Duration::from_secs(var_or("LEASE_DURATION_SECS", 900u64)?);
        let job_timeout = Duration::from_secs(var_or("JOB_TIMEOUT_SECS", 600u64)?);
        validate_timeouts(job_timeout, lease_duration)?;

        let config = Config {
            github_app_id,
            github_private_key,
            webhook_secrets,
            github_api_base,
            llm_api_key,
            llm_base_url,
            llm_model,
            llm_timeout: Duration::from_secs(var_or("LLM_TIMEOUT_SECS", 60u64)?),
            llm_max_tokens: var_or("LLM_MAX_TOKENS", 2048u32)?,
            agent_max_steps: var_or("AGENT_MAX_STEPS", 20u32)?,
            agent_max_tool_output_chars: var_or("AGENT_MAX_TOOL_OUTPUT_CHARS", 20_000usize)?,
            port,
            artifacts_dir,
            workdir_root,
            state_dir,
            max_iterations: var_or("MAX_ITERATIONS", 3u32)?,
            max_attempts: var_or("MAX_ATTEMPTS", 5u32)?,
            lease_duration,
            job_timeout,
            reap_interval: Duration::from_secs(var_or("REAP_INTERVAL_SECS", 30u64)?),
            retry_backoff: Duration::from_secs(var_or("RETRY_BACKOFF_SECS", 10u64)?),
            worker_poll_interval: Duration::from_millis(var_or("WORKER_POLL_INTERVAL_MS", 1000u64)?),
            delivery_retention: Duration::from_secs(
                var_or("DELIVERY_RETENTION_DAYS", 14u64)? * 24 * 60 * 60,
            ),
            required_checks: parse_csv_list(env::var("REQUIRED_CHECKS").ok().as_deref()),
            trigger_label: parse_optional_token(env::var("TRIGGER_LABEL").ok()),
            git_user_name: env::var("GIT_USER_NAME").unwrap_or_else(|_| "agentloop".to_string()),
            git_user_email: env::var("GIT_USER_EMAIL")
                .unwrap_or_else(|_| "agentloop@users.noreply.github.com".to_string()),
        };

        if config.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("agentloop.db")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: self.retry_backoff,
            backoff_cap: Duration::from_secs(15 * 60),
        }
    }
}

/// A job must time out before its lease can expire, or the reaper could hand
/// it to another worker while it is still running.
pub fn validate_timeouts(job_timeout: Duration, lease_duration: Duration) -> Result<()> {
    if job_timeout.is_zero() {
        bail!("JOB_TIMEOUT_SECS must be positive");
    }
    if job_timeout >= lease_duration {
        bail!(
            "JOB_TIMEOUT_SECS ({}) must be less than LEASE_DURATION_SECS ({})",
            job_timeout.as_secs(),
            lease_duration.as_secs()
        );
    }
    Ok(())
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_csv_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns None if the value is missing, empty, or contains only whitespace.
/// An empty webhook secret would make every signature trivially forgeable.
pub fn parse_optional_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
