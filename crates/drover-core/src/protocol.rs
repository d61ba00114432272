//! The agent-to-server protocol.
//!
//! Every operation is an independent request carrying the agent's
//! [`AgentInfo`] (uuid, cookie, reported status). Implementations must
//! tolerate retried and duplicated calls: typed outcomes such as an unknown
//! cookie or a stale report are expressed in the return value, and `Err` is
//! reserved for infrastructure failures.

use crate::Result;
use crate::agent::AgentInfo;
use crate::ids::{Cookie, JobIdentifier};
use crate::job::{JobResult, JobState};
use crate::work::{AgentInstruction, Work};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait AgentProtocol: Send + Sync {
    /// Record that the agent is alive and return any pending instruction
    /// for its current job.
    async fn ping(&self, info: &AgentInfo) -> Result<AgentInstruction>;

    /// Issue a cookie for a freshly started agent process.
    async fn get_cookie(&self, info: &AgentInfo) -> Result<Cookie>;

    async fn get_work(&self, info: &AgentInfo) -> Result<Work>;

    /// Advance a job the agent is running. Stale or duplicate reports are
    /// accepted and ignored.
    async fn report_current_status(
        &self,
        info: &AgentInfo,
        job: &JobIdentifier,
        state: JobState,
    ) -> Result<()>;

    async fn report_completing(
        &self,
        info: &AgentInfo,
        job: &JobIdentifier,
        result: JobResult,
    ) -> Result<()>;

    async fn report_completed(
        &self,
        info: &AgentInfo,
        job: &JobIdentifier,
        result: JobResult,
    ) -> Result<()>;

    /// Whether the agent should abandon the job: it was cancelled, finished
    /// or handed to another agent.
    async fn is_ignored(&self, info: &AgentInfo, job: &JobIdentifier) -> Result<bool>;
}

/// Wire envelope for transports that carry protocol calls as messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProtocolRequest {
    Ping {
        info: AgentInfo,
    },
    GetCookie {
        info: AgentInfo,
    },
    GetWork {
        info: AgentInfo,
    },
    ReportCurrentStatus {
        info: AgentInfo,
        job: JobIdentifier,
        state: JobState,
    },
    ReportCompleting {
        info: AgentInfo,
        job: JobIdentifier,
        result: JobResult,
    },
    ReportCompleted {
        info: AgentInfo,
        job: JobIdentifier,
        result: JobResult,
    },
    IsIgnored {
        info: AgentInfo,
        job: JobIdentifier,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProtocolResponse {
    Instruction { instruction: AgentInstruction },
    Cookie { cookie: Cookie },
    Work { work: Work },
    Ack,
    Ignored { ignored: bool },
}

impl ProtocolRequest {
    /// Dispatch a decoded request to a protocol implementation.
    pub async fn handle<P: AgentProtocol + ?Sized>(self, protocol: &P) -> Result<ProtocolResponse> {
        Ok(match self {
            ProtocolRequest::Ping { info } => ProtocolResponse::Instruction {
                instruction: protocol.ping(&info).await?,
            },
            ProtocolRequest::GetCookie { info } => ProtocolResponse::Cookie {
                cookie: protocol.get_cookie(&info).await?,
            },
            ProtocolRequest::GetWork { info } => ProtocolResponse::Work {
                work: protocol.get_work(&info).await?,
            },
            ProtocolRequest::ReportCurrentStatus { info, job, state } => {
                protocol.report_current_status(&info, &job, state).await?;
                ProtocolResponse::Ack
            }
            ProtocolRequest::ReportCompleting { info, job, result } => {
                protocol.report_completing(&info, &job, result).await?;
                ProtocolResponse::Ack
            }
            ProtocolRequest::ReportCompleted { info, job, result } => {
                protocol.report_completed(&info, &job, result).await?;
                ProtocolResponse::Ack
            }
            ProtocolRequest::IsIgnored { info, job } => ProtocolResponse::Ignored {
                ignored: protocol.is_ignored(&info, &job).await?,
            },
        })
    }
}
