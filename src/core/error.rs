//! 环境错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 EnvError 决定结束回合 / 重启设备 / 本地吸收 / 上抛。

use std::fmt;

use thiserror::Error;

/// 玩家离开预期画面的方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// 前台 Activity 不符（或连续多次取不到）
    Activity,
    /// dumpsys 视图层级路径不符
    ViewHierarchy,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Activity => f.write_str("activity"),
            ExitReason::ViewHierarchy => f.write_str("view hierarchy"),
        }
    }
}

/// 环境运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EnvError {
    /// 设备或远程通道不可达 / 重试耗尽
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// 任务 setup / reset 步骤失败
    #[error("Step command failed: {0}")]
    StepCommand(String),

    #[error("Check error in {sensor}: {message}")]
    CheckError { sensor: String, message: String },

    #[error("Player exited the expected {0}")]
    PlayerExited(ExitReason),

    #[error("Too many restarts ({attempts} attempts)")]
    TooManyRestarts { attempts: u32 },

    #[error("Event graph error: {0}")]
    EventGraph(String),

    #[error("Selector error: {0}")]
    Selector(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for EnvError {
    fn from(e: reqwest::Error) -> Self {
        EnvError::Transport(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 结束当前回合，不重启
    EndEpisode,
    /// 设置待重启标记，下次 reset 时走重启流程
    Restart,
    /// 记录计数后继续
    Absorb,
    /// 不可恢复，上抛给调用方
    Escalate,
}
