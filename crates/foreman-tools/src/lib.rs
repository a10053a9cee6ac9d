// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod backoff;
pub mod builtin;
pub mod interrupt;
pub mod policy;
pub mod protected;
pub mod registry;
pub mod schema;
pub mod tool;

pub use backoff::DenialBackoff;
pub use policy::AllowList;
pub use protected::ProtectedPaths;
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolError, ToolOutput};

pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::shell::ShellTool;
pub use builtin::write_file::WriteFileTool;
