//! 任务定义：元信息、期望画面、回合上限、setup / reset 步骤、事件与输出
//!
//! 文件按扩展名选择格式：`.json` 用 serde_json，其余按 TOML 解析。

use std::path::Path;

use serde::Deserialize;

use crate::core::EnvError;
use crate::events::{BuiltEvents, EventDecl, GraphBuilder, OutputDecls};

/// setup / reset 中的一步
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupStep {
    /// 通过控制通道执行一条 adb 命令；`expect` 为输出中必须出现的子串
    Adb {
        args: Vec<String>,
        #[serde(default = "default_step_timeout_sec")]
        timeout_sec: f64,
        #[serde(default)]
        expect: Option<String>,
    },
    Sleep { seconds: f64 },
}

fn default_step_timeout_sec() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 文本输入动作的词表；动作携带的是词表下标
    #[serde(default)]
    pub vocabulary: Vec<String>,
    /// 期望的前台 Activity（`package/.Activity`）
    #[serde(default)]
    pub expected_activity: Option<String>,
    /// dumpsys 视图层级逐层的正则
    #[serde(default)]
    pub view_hierarchy_path: Vec<String>,
    /// 0 表示不限
    #[serde(default)]
    pub max_num_steps: u32,
    /// 0 表示不限
    #[serde(default)]
    pub max_duration_sec: f64,
    #[serde(default)]
    pub setup_steps: Vec<SetupStep>,
    #[serde(default)]
    pub reset_steps: Vec<SetupStep>,
    #[serde(default)]
    pub events: Vec<EventDecl>,
    #[serde(default)]
    pub outputs: OutputDecls,
}

impl TaskDefinition {
    pub fn load(path: &Path) -> Result<Self, EnvError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EnvError::Config(format!("cannot read task file {}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let task = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        tracing::info!(task = %task.id, path = %path.display(), events = task.events.len(), "task definition loaded");
        Ok(task)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, EnvError> {
        toml::from_str(raw).map_err(|e| EnvError::Config(format!("invalid task definition: {e}")))
    }

    pub fn from_json_str(raw: &str) -> Result<Self, EnvError> {
        serde_json::from_str(raw).map_err(|e| EnvError::Config(format!("invalid task definition: {e}")))
    }

    /// 构建本任务的事件图与输出槽
    pub fn build_events(&self, buffer_limit: usize) -> Result<BuiltEvents, EnvError> {
        GraphBuilder::new(buffer_limit).build(&self.events, &self.outputs)
    }
}
