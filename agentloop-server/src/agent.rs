//! Tool-using agents.
//!
//! An agent run is a conversation with a chat model: every turn is either a
//! tool call, answered with the tool's output, or a final answer. Invalid
//! turns get a corrective message. Runs are bounded by a step budget.

use std::sync::Arc;

use agentloop_core::{
    code_agent_system_prompt, create_code_agent_prompt, create_reviewer_prompt, parse_reply,
    reviewer_system_prompt, AgentReply, CodeProposal, ReviewDecision, ReviewVerdict,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::gateway::ToolGateway;
use crate::http_client::{classify_error, create_client, ApiError, ServiceType, CORRELATION_ID_HEADER};

pub const STEP_BUDGET_EXHAUSTED: &str = "step budget exhausted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, correlation_id: Option<&str>, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct LlmClient {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_key: String,
        base_url: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client: create_client(ServiceType::Llm, Some(timeout)),
            api_key,
            base_url: base_url.into(),
            model: model.into(),
            max_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, correlation_id: Option<&str>, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: 0.2,
        };

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request);
        if let Some(id) = correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, id);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::Error::new(ApiError {
                service: ServiceType::Llm,
                operation: "chat completion".to_string(),
                status,
                body,
            }));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("Chat completion returned no content"))
    }
}

/// Output of an agent run plus the conversation that produced it.
#[derive(Debug, Clone)]
pub struct AgentRun<T> {
    pub output: T,
    pub transcript: Vec<ChatMessage>,
}

/// The Reviewer's outcome. Only the state machine turns it into policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approve(ReviewVerdict),
    Fix(ReviewVerdict),
    /// No usable verdict; the review should be retried.
    Error(String),
}

impl ReviewOutcome {
    pub fn from_verdict(verdict: ReviewVerdict) -> Self {
        match verdict.effective_decision() {
            ReviewDecision::Approve => Self::Approve(verdict),
            ReviewDecision::Fix => Self::Fix(verdict),
        }
    }
}

pub struct CodeTask<'a> {
    pub issue_title: &'a str,
    pub issue_body: &'a str,
    /// Rendered review of the previous attempt, for fix iterations.
    pub feedback: Option<&'a str>,
    pub gateway: &'a ToolGateway,
    pub correlation_id: &'a str,
}

pub struct ReviewTask<'a> {
    pub pr_label: &'a str,
    pub head_sha: &'a str,
    pub issue_title: &'a str,
    pub issue_body: &'a str,
    pub ci_summary: &'a str,
    pub gateway: &'a ToolGateway,
    pub correlation_id: &'a str,
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn propose_change(&self, task: CodeTask<'_>) -> Result<AgentRun<CodeProposal>, JobError>;

    async fn review(&self, task: ReviewTask<'_>) -> Result<AgentRun<ReviewOutcome>, JobError>;
}

enum LoopEnd {
    Final(Value),
    BudgetExhausted,
}

pub struct LlmAgent {
    model: Arc<dyn ChatModel>,
    max_steps: u32,
}

impl LlmAgent {
    pub fn new(model: Arc<dyn ChatModel>, max_steps: u32) -> Self {
        Self { model, max_steps }
    }

    /// Drive the conversation until a final answer or until `max_steps`
    /// non-final turns were spent.
    async fn run(
        &self,
        gateway: &ToolGateway,
        system: String,
        user: String,
        correlation_id: &str,
    ) -> Result<(LoopEnd, Vec<ChatMessage>), JobError> {
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];

        for step in 0..=self.max_steps {
            let reply = self
                .model
                .complete(Some(correlation_id), &messages)
                .await
                .map_err(|e| classify_error(&e).context("LLM call"))?;
            messages.push(ChatMessage::assistant(reply.clone()));

            if step == self.max_steps {
                // Last turn: only a final answer is still accepted.
                if let Ok(AgentReply::Final(value)) = parse_reply(&reply) {
                    return Ok((LoopEnd::Final(value), messages));
                }
                break;
            }

            match parse_reply(&reply) {
                Ok(AgentReply::Final(value)) => {
                    debug!("{:?} agent finished after {} steps", gateway.role(), step);
                    return Ok((LoopEnd::Final(value), messages));
                }
                Ok(AgentReply::ToolCall { tool, args }) => {
                    debug!("{:?} agent calls {}", gateway.role(), tool);
                    let observation = gateway.observe(&tool, &args).await?;
                    messages.push(ChatMessage::user(format!(
                        "Tool result ({}):\n{}",
                        tool, observation
                    )));
                }
                Err(e) => {
                    debug!("Invalid agent reply: {}", e);
                    messages.push(ChatMessage::user(e.corrective_message()));
                }
            }
        }

        warn!(
            "{:?} agent used its budget of {} steps",
            gateway.role(),
            self.max_steps
        );
        Ok((LoopEnd::BudgetExhausted, messages))
    }
}

#[async_trait]
impl Agent for LlmAgent {
    async fn propose_change(&self, task: CodeTask<'_>) -> Result<AgentRun<CodeProposal>, JobError> {
        let prompt = create_code_agent_prompt(
            task.issue_title,
            task.issue_body,
            task.feedback,
            &task.gateway.descriptions(),
        );
        let (end, transcript) = self
            .run(task.gateway, code_agent_system_prompt(), prompt, task.correlation_id)
            .await?;

        match end {
            LoopEnd::Final(value) => {
                let proposal = CodeProposal::from_final(value)
                    .map_err(|e| JobError::transient(format!("unusable code proposal: {}", e)))?;
                info!(
                    "Code agent proposed {} edits: {}",
                    proposal.edits.len(),
                    proposal.summary
                );
                Ok(AgentRun {
                    output: proposal,
                    transcript,
                })
            }
            LoopEnd::BudgetExhausted => Err(JobError::transient(format!(
                "code agent: {}",
                STEP_BUDGET_EXHAUSTED
            ))),
        }
    }

    async fn review(&self, task: ReviewTask<'_>) -> Result<AgentRun<ReviewOutcome>, JobError> {
        let prompt = create_reviewer_prompt(
            task.pr_label,
            task.head_sha,
            task.issue_title,
            task.issue_body,
            task.ci_summary,
            &task.gateway.descriptions(),
        );
        let (end, transcript) = self
            .run(task.gateway, reviewer_system_prompt(), prompt, task.correlation_id)
            .await?;

        let output = match end {
            LoopEnd::Final(value) => match ReviewVerdict::from_final(value) {
                Ok(verdict) => ReviewOutcome::from_verdict(verdict),
                Err(e) => ReviewOutcome::Error(format!("unusable verdict: {}", e)),
            },
            LoopEnd::BudgetExhausted => ReviewOutcome::Fix(ReviewVerdict {
                decision: ReviewDecision::Fix,
                summary: STEP_BUDGET_EXHAUSTED.to_string(),
                findings: Vec::new(),
                ci: String::new(),
            }),
        };
        Ok(AgentRun { output, transcript })
    }
}
