//! Handler adapter interface for task executors.
//!
//! A handler executes one task inside a worktree and returns a structured
//! [`ExecutionResult`]. The module defines the object-safe [`Handler`]
//! trait, the [`HandlerRegistry`] for runtime lookup by route key, and the
//! two built-in handlers: the headless coding-agent CLI
//! ([`ClaudeCodeHandler`]) and the manual-action marker
//! ([`ManualHandler`]).

pub mod claude_code;
pub mod manual;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use claude_code::ClaudeCodeHandler;
pub use manual::ManualHandler;
pub use registry::HandlerRegistry;
pub use trait_def::Handler;
pub use types::ExecutionResult;
