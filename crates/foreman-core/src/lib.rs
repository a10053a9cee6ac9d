// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod approval;
mod dispatch;
mod events;
mod executor;
pub mod notify;
mod services;
mod session;
mod subagent;
mod transcript;

#[cfg(test)]
mod tests;


pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalPrompt, AutoDenyPrompt, ProxyApprovalPrompt,
};
pub use dispatch::Dispatcher;
pub use events::AgentEvent;
pub use executor::TurnExecutor;
pub use notify::{AsyncEvent, EventPipe};
pub use services::Services;
pub use session::{ProcessOptions, Session, TurnOutcome};
pub use subagent::{
    SubAgentManager, SubAgentSpawnTool, SubAgentStatus, SubAgentStatusTool, SubAgentWaitTool,
    ENV_APPROVAL_REPLY_FD, ENV_APPROVAL_REQUEST_FD, ENV_IS_SUBAGENT,
};
pub use transcript::Transcript;
