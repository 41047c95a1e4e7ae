//! 核心编排层：错误与恢复、计数器、检查门控、回合任务、状态投影、主控编排、优雅关闭

pub mod counters;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod task;

pub use counters::{Counters, RestartCause};
pub use error::{EnvError, ExitReason, RecoveryAction};
pub use gate::{GatePolicy, GateTracker, Trigger, TriggerSet};
pub use orchestrator::{create_orchestrator, Orchestrator};
pub use recovery::RecoveryEngine;
pub use shutdown::{CleanupStep, OrchestratorCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{ActuatorState, EpisodePhase, StepOutcome};
pub use task::{CheckReport, EpisodeEnd, EpisodeTask, Harvest};
