//! 状态定义：回合阶段、设备状态与单步结果
//!
//! 编排器维护内部完整状态；对外只暴露这几个轻量、可序列化的投影。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::device::Observation;

/// 回合阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    /// 已 reset，尚未执行第一步
    Idle,
    Stepping,
    /// 回合已结束，等待下一次 reset
    Terminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    Launched,
    NotLaunched,
}

/// `execute_action` 的返回值
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub observation: Option<Observation>,
    pub reward: f64,
    pub extras: Map<String, Value>,
    pub instructions: Vec<String>,
    pub episode_end: bool,
}

impl StepOutcome {
    /// 退化结果：回合结束、无观测
    pub fn ended() -> Self {
        Self {
            episode_end: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ended_outcome_is_empty() {
        let outcome = StepOutcome::ended();
        assert!(outcome.episode_end);
        assert!(outcome.observation.is_none());
        assert_eq!(outcome.reward, 0.0);
        assert!(outcome.extras.is_empty());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&EpisodePhase::Terminal).unwrap(), "\"terminal\"");
        assert_eq!(serde_json::to_string(&ActuatorState::NotLaunched).unwrap(), "\"not_launched\"");
    }
}
