//! Mobile-Env - 移动端交互环境的回合编排核心
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 编排、回合任务、检查门控、计数器、错误恢复、优雅关闭
//! - **device**: 动作 / 观测模型、设备能力 trait、远程执行通道
//! - **events**: 事件代数（事件源、组合槽、值管线、事件图构建）
//! - **observability**: tracing 初始化
//! - **sensors**: 四类传感器 worker（日志、UI 状态、视觉、UI 树）
//! - **task**: 任务定义与 setup 步骤解释

pub mod config;
pub mod core;
pub mod device;
pub mod events;
pub mod observability;
pub mod sensors;
pub mod task;

pub use crate::core::{EnvError, Orchestrator, StepOutcome};
