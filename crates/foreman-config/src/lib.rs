// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod home;
mod loader;
mod schema;

pub use home::{home_dir, logs_dir, store_path};
pub use loader::load;
pub use schema::{
    AgentConfig, Config, ModelConfig, SubAgentConfig, SupervisorConfig, ToolsConfig,
    SUBAGENT_HARD_CAP, SUBAGENT_WAIT_CAP_SECS,
};
