//! Agent configuration management and runtime assembly for agent-vault.
//!
//! This crate provides:
//! - `AgentManager`: cached, persisted agent configurations with rollback
//! - `build_tools`: turning declared tools into runtime tools
//! - `AgentService`: resolving a configuration and model selection into a
//!   runnable agent, including its handoff graph

pub mod manager;
pub mod service;
pub mod tool_conversion;

pub use manager::AgentManager;
pub use service::AgentService;
pub use tool_conversion::{
    build_tools, default_output_extractor, Diagnostic, DiagnosticLevel, OutputExtractor,
    ToolBuildOutput,
};
