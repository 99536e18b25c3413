//! Shell-side agent management: spawning agent helper processes, the
//! per-agent worker state machines and typed message loops, and the manager
//! that owns the whole set. Also the agent-mode entry points the spawned
//! children run.

pub mod annotation;
pub mod child;
pub mod ext_source;
pub mod manager;
pub mod perf_worker;
pub mod perfetto;
pub mod spawner;
pub mod worker;

pub use manager::{AgentManager, ManagerParent};
pub use spawner::{
    AgentSpawner, AndroidPackageSpawner, PrivilegeLevel, SimpleSpawner, AGENT_ID_ANNOTATION,
    AGENT_ID_EXTERNAL, AGENT_ID_PERF, AGENT_ID_PERFETTO,
};
pub use worker::{AgentState, WorkerCore};
