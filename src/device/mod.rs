//! 设备层：动作 / 观测类型、执行器与控制通道能力接口
//!
//! - **ui_node**: UI 树节点与 uiautomator XML 解析
//! - **text**: 文本输入到按键序列的映射
//! - **remote**: 基于 HTTP/JSON 守护进程的远程执行器

pub mod remote;
pub mod text;
pub mod ui_node;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::EnvError;

pub use remote::{RemoteActuator, RemoteControlChannel, RemoteTransport};
pub use text::{KeyStroke, TextMapper};
pub use ui_node::UiNode;

/// 动作类型，线上格式为整数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    Touch = 0,
    Lift = 1,
    Repeat = 2,
    Text = 3,
}

impl Serialize for ActionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(ActionType::Touch),
            1 => Ok(ActionType::Lift),
            2 => Ok(ActionType::Repeat),
            3 => Ok(ActionType::Text),
            other => Err(serde::de::Error::custom(format!("unknown action type {other}"))),
        }
    }
}

/// 单个动作；`response` 非空时为自由文本回复，直接投递给回复类事件源
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touch_position: Option<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl Action {
    pub fn touch(x: f32, y: f32) -> Self {
        Self {
            action_type: ActionType::Touch,
            touch_position: Some([x, y]),
            input_token: None,
            response: None,
        }
    }

    pub fn lift() -> Self {
        Self {
            action_type: ActionType::Lift,
            touch_position: Some([0.0, 0.0]),
            input_token: None,
            response: None,
        }
    }

    pub fn repeat() -> Self {
        Self {
            action_type: ActionType::Repeat,
            touch_position: None,
            input_token: None,
            response: None,
        }
    }

    pub fn text(token: u32) -> Self {
        Self {
            action_type: ActionType::Text,
            touch_position: None,
            input_token: Some(token),
            response: None,
        }
    }

    pub fn response(text: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Repeat,
            touch_position: None,
            input_token: None,
            response: Some(text.into()),
        }
    }

    /// 空字符串视为没有回复
    pub fn response_text(&self) -> Option<&str> {
        self.response.as_deref().filter(|s| !s.is_empty())
    }
}

/// 原始 RGB 截图
#[derive(Clone, Debug, PartialEq)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Screenshot {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Observation {
    pub pixels: Arc<Screenshot>,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub view_hierarchy: Option<Arc<UiNode>>,
}

/// 逐行日志流
#[async_trait]
pub trait LogStream: Send {
    /// None 表示流已结束
    async fn next_line(&mut self) -> Result<Option<String>, EnvError>;

    async fn set_filters(&mut self, filters: &[String]) -> Result<(), EnvError>;
}

/// 设备执行器能力：启动 / 动作 / 观测 / 日志 / 控制通道
#[async_trait]
pub trait Actuator: Send + Sync {
    /// 已启动时重启
    async fn launch(&self) -> Result<(), EnvError>;

    fn is_launched(&self) -> bool;

    async fn send_action(&self, actions: &[Action]) -> Result<(), EnvError>;

    async fn get_observation(&self) -> Result<Observation, EnvError>;

    async fn get_log_stream(&self) -> Result<Box<dyn LogStream>, EnvError>;

    async fn create_control_channel(&self) -> Result<Arc<dyn ControlChannel>, EnvError>;

    async fn close(&self) -> Result<(), EnvError>;

    /// 自上次启动以来的时长；未启动为 None
    fn uptime(&self) -> Option<Duration>;
}

/// 设备控制通道（adb 风格命令透传）
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// 执行一条命令；无输出时返回 None
    async fn execute(&self, args: &[String], timeout: Duration) -> Result<Option<String>, EnvError>;

    /// 前台 Activity，形如 `com.pkg/.MainActivity`
    async fn current_activity(&self) -> Result<String, EnvError> {
        let output = self.shell(&["am", "stack", "list"]).await?;
        parse_visible_activity(&output)
            .ok_or_else(|| EnvError::MalformedResponse("no visible activity in stack list".to_string()))
    }

    async fn activity_dumpsys(&self, package: &str) -> Result<String, EnvError> {
        self.shell(&["dumpsys", "activity", package, package]).await
    }

    async fn ui_tree(&self) -> Result<UiNode, EnvError> {
        let xml = self
            .shell(&["uiautomator", "dump", "/dev/tty"])
            .await?;
        let start = xml
            .find("<?xml")
            .or_else(|| xml.find("<hierarchy"))
            .ok_or_else(|| EnvError::MalformedResponse("uiautomator produced no xml".to_string()))?;
        let end = xml.rfind('>').map_or(xml.len(), |i| i + 1);
        UiNode::parse_xml(&xml[start..end])
    }

    /// (height, width)
    async fn screen_dimensions(&self) -> Result<(u32, u32), EnvError> {
        let output = self.shell(&["wm", "size"]).await?;
        parse_wm_size(&output)
            .ok_or_else(|| EnvError::MalformedResponse(format!("unexpected wm size output: {output}")))
    }

    async fn input_text(&self, text: &str) -> Result<(), EnvError> {
        self.shell(&["input", "text", text]).await.map(|_| ())
    }

    async fn input_key(&self, key: &str) -> Result<(), EnvError> {
        self.shell(&["input", "keyevent", key]).await.map(|_| ())
    }

    async fn shell(&self, cmd: &[&str]) -> Result<String, EnvError> {
        let mut args = vec!["shell".to_string()];
        args.extend(cmd.iter().map(|s| s.to_string()));
        Ok(self
            .execute(&args, Duration::from_secs(10))
            .await?
            .unwrap_or_default())
    }
}

fn parse_visible_activity(output: &str) -> Option<String> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"taskId=\d+:\s+(\S+/\S+)\s.*visible=true").expect("static regex")
    });
    output
        .lines()
        .find_map(|line| re.captures(line))
        .map(|caps| caps[1].to_string())
}

fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+)x(\d+)").expect("static regex"));
    // Override size 优先于 Physical size
    let line = output
        .lines()
        .find(|l| l.contains("Override size"))
        .or_else(|| output.lines().find(|l| l.contains("Physical size")))?;
    let caps = re.captures(line)?;
    let width = caps[1].parse().ok()?;
    let height = caps[2].parse().ok()?;
    Some((height, width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let json = serde_json::to_value(vec![Action::touch(0.5, 0.25), Action::text(7)]).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"action_type": 0, "touch_position": [0.5, 0.25]},
                {"action_type": 3, "input_token": 7}
            ])
        );
        let back: Action = serde_json::from_value(serde_json::json!({"action_type": 1})).unwrap();
        assert_eq!(back.action_type, ActionType::Lift);
        assert!(serde_json::from_value::<Action>(serde_json::json!({"action_type": 9})).is_err());
    }

    #[test]
    fn test_empty_response_ignored() {
        assert_eq!(Action::response("").response_text(), None);
        assert_eq!(Action::response("yes").response_text(), Some("yes"));
    }

    #[test]
    fn test_parse_visible_activity() {
        let out = "RootTask id=1 bounds=[0,0][1080,1920] displayId=0 userId=0\n\
                   \x20 taskId=12: com.android.settings/com.android.settings.Settings bounds=[0,0][1080,1920] userId=0 visible=true\n\
                   \x20 taskId=3: com.google.android.apps.nexuslauncher/.NexusLauncherActivity bounds=[0,0][1080,1920] userId=0 visible=false";
        assert_eq!(
            parse_visible_activity(out).as_deref(),
            Some("com.android.settings/com.android.settings.Settings")
        );
        assert_eq!(parse_visible_activity("nothing here"), None);
    }

    #[test]
    fn test_parse_wm_size_prefers_override() {
        assert_eq!(parse_wm_size("Physical size: 1080x1920"), Some((1920, 1080)));
        assert_eq!(
            parse_wm_size("Physical size: 1080x1920\nOverride size: 720x1280"),
            Some((1280, 720))
        );
        assert_eq!(parse_wm_size("error"), None);
    }
}
