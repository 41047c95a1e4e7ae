//! 具名计数器：进程生命周期内累积，`episode_` 前缀的在每次 reset 时清零

use std::collections::BTreeMap;
use std::fmt;

/// 重启原因（每个原因一个计数器）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RestartCause {
    SimulatorLaunch,
    SetupSteps,
    SimulatorReset,
    ExecuteAction,
    FetchObservation,
    MaxBadStates,
    Periodic,
    StepTimeout,
}

impl RestartCause {
    pub fn counter(self) -> &'static str {
        match self {
            RestartCause::SimulatorLaunch => "restart_count_simulator_launch",
            RestartCause::SetupSteps => "restart_count_setup_steps",
            RestartCause::SimulatorReset => "restart_count_simulator_reset",
            RestartCause::ExecuteAction => "restart_count_execute_action",
            RestartCause::FetchObservation => "restart_count_fetch_observation",
            RestartCause::MaxBadStates => "restart_count_max_bad_states",
            RestartCause::Periodic => "restart_count_periodic",
            RestartCause::StepTimeout => "restart_count_step_timeout",
        }
    }
}

impl fmt::Display for RestartCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.counter().trim_start_matches("restart_count_"))
    }
}

pub const TOTAL_STEPS: &str = "total_steps";
pub const EPISODE_STEPS: &str = "episode_steps";
pub const RESTART_COUNT: &str = "restart_count";
pub const RESET_COUNT_PLAYER_EXITED: &str = "reset_count_player_exited";
pub const RESET_COUNT_EPISODE_END: &str = "reset_count_episode_end";
pub const RESET_COUNT_MAX_DURATION: &str = "reset_count_max_duration_reached";

#[derive(Clone, Debug, Default)]
pub struct Counters {
    values: BTreeMap<String, u64>,
}

impl Counters {
    /// 预置所有已知计数器为 0，便于运维直接查看
    pub fn new() -> Self {
        let mut counters = Self::default();
        for name in [
            TOTAL_STEPS,
            EPISODE_STEPS,
            RESTART_COUNT,
            RESET_COUNT_PLAYER_EXITED,
            RESET_COUNT_EPISODE_END,
            RESET_COUNT_MAX_DURATION,
        ] {
            counters.values.insert(name.to_string(), 0);
        }
        for cause in [
            RestartCause::SimulatorLaunch,
            RestartCause::SetupSteps,
            RestartCause::SimulatorReset,
            RestartCause::ExecuteAction,
            RestartCause::FetchObservation,
            RestartCause::MaxBadStates,
            RestartCause::Periodic,
            RestartCause::StepTimeout,
        ] {
            counters.values.insert(cause.counter().to_string(), 0);
        }
        counters
    }

    pub fn incr(&mut self, name: &str) -> u64 {
        let v = self.values.entry(name.to_string()).or_insert(0);
        *v += 1;
        *v
    }

    pub fn incr_restart(&mut self, cause: RestartCause) -> u64 {
        self.incr(cause.counter())
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn restart(&self, cause: RestartCause) -> u64 {
        self.get(cause.counter())
    }

    /// 清零回合级计数器
    pub fn reset_episode(&mut self) {
        for (name, v) in self.values.iter_mut() {
            if name.starts_with("episode_") {
                *v = 0;
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values.clone()
    }
}
