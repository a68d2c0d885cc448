//! Peregrine is an autonomous agent task runtime: given a natural-language
//! goal and a catalog of tools, it plans a sequence of steps, invokes tools
//! to execute them, observes results, reflects, and reports progress as a
//! live event stream.
//!
//! The crate is the *task execution engine*: the ReAct-style
//! plan/act/observe/reflect loop, tool dispatch with bounded parallelism
//! and retry, the guardrail/approval protocol, the per-task evidence
//! chain, checkpointed state persistence, and a provider-aware model
//! router. LLM backends, tool implementations, and memory stores are
//! consumed capabilities behind traits.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use peregrine::prelude::*;
//!
//! let mut providers = ProviderRegistry::new();
//! providers.register(my_provider);
//!
//! let mut tools = ToolRegistry::new();
//! tools.register(my_tool_spec);
//!
//! let service = TaskService::new(
//!     providers,
//!     "ollama",
//!     "qwen3:8b",
//!     Arc::new(tools),
//!     Arc::new(MemoryStore::new()),
//! );
//!
//! let handle = service
//!     .start_task(StartTaskRequest::new("user", "workspace", "Summarize the report"))
//!     .await?;
//! while let Some(event) = handle.events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod evidence;
pub mod exec;
pub mod guardrails;
pub mod hooks;
pub mod metrics;
pub mod plan;
pub mod planner;
pub mod prelude;
pub mod provider;
pub mod router;
pub mod service;
pub mod store;
pub mod task;
pub mod tool;

pub use error::{Error, Result};
