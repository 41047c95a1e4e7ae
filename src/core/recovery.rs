//! 错误恢复引擎
//!
//! 根据 EnvError 类型返回 RecoveryAction，供编排器决定是结束回合、重启、吸收还是上抛。

use crate::core::{EnvError, RecoveryAction};

/// 错误分类：传输 / 任务步骤 / 检查 / 玩家离开 / 重启过多
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &EnvError) -> RecoveryAction {
        match err {
            // 动作 / 观测失败：本回合结束，设备视为宕机
            EnvError::Transport(_) | EnvError::MalformedResponse(_) => RecoveryAction::Restart,
            EnvError::StepCommand(_) => RecoveryAction::Restart,
            EnvError::CheckError { .. } => RecoveryAction::Absorb,
            EnvError::PlayerExited(_) => RecoveryAction::EndEpisode,
            EnvError::TooManyRestarts { .. } => RecoveryAction::Escalate,
            EnvError::EventGraph(_) | EnvError::Selector(_) | EnvError::Config(_) => RecoveryAction::Escalate,
        }
    }

    /// 只有 Escalate 允许离开编排器
    pub fn is_fatal(&self, err: &EnvError) -> bool {
        self.handle(err) == RecoveryAction::Escalate
    }
}
