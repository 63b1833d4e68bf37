//! The agentic loop and its collaborators.

pub mod events;
mod executor;
pub mod hooks;
pub mod orchestrator;
pub mod stream;
pub mod worker;

pub use events::{AgentEvent, DoneInfo, DoneReason};
pub use hooks::{
    HookDecision, HookEvent, HookHandler, HookInput, HookOutcome, HookRegistry, LoggingHook,
};
pub use orchestrator::{
    AgentConfig, AgentLoop, AgentServices, CompactionConfig, Compactor,
};
pub use stream::{TurnAccumulator, TurnOutcome};
pub use worker::{WorkerArchetype, WorkerManager, WorkerOutcome, WorkerSpec, WorkerState};
