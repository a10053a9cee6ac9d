// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod goap_tools;
mod supervisor;
mod worker;
mod worker_supervisor;

pub use goap_tools::{
    register_goap_tools, GoapCheckCompleteTool, GoapCompleteActionTool, GoapDispatchActionTool,
    GoapFailActionTool, GoapPlanActionsTool, GoapSpawnWorkerTool,
};
pub use supervisor::{
    Supervisor, SUPERVISOR_EXIT_COMPLETE, SUPERVISOR_EXIT_CONTEXT, SUPERVISOR_EXIT_ERROR,
};
pub use worker::{run_worker, WorkerOptions, ENV_NOTIFY_FD};
pub use worker_supervisor::{WorkerHandle, WorkerStatus, WorkerSupervisor};
