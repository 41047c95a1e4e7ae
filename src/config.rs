//! 环境配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MENV__*` 覆盖（双下划线表示嵌套，如 `MENV__REMOTE__PORT=5001`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{EnvError, GatePolicy, Trigger, TriggerSet};

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub orchestrator: OrchestratorConfig,
    pub sensors: SensorsConfig,
    pub task: TaskSection,
}

/// [remote] 段：远程守护进程地址与超时
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 单步调用（act / observ / adb）的超时
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// launch / restart / close 的超时
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: f64,
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// 观测缩放到 [w, h]
    #[serde(default)]
    pub resize_to: Option<[u32; 2]>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_timeout_secs() -> f64 {
    10.0
}

fn default_launch_timeout_secs() -> f64 {
    300.0
}

fn default_retry() -> u32 {
    3
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            launch_timeout_secs: default_launch_timeout_secs(),
            retry: default_retry(),
            resize_to: None,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// 距上次成功观测超过该秒数则强制结束回合；0 表示不限
    #[serde(default)]
    pub step_timeout_secs: f64,
    /// 帧率上限；非正数表示不节流
    #[serde(default)]
    pub max_steps_per_sec: f64,
    /// 设备运行超过该分钟数后，在下一个回合边界重启；0 表示不启用
    #[serde(default)]
    pub periodic_restart_time_min: f64,
    #[serde(default)]
    pub force_launch: bool,
    #[serde(default)]
    pub with_view_hierarchy: bool,
    #[serde(default = "default_max_restart_retries")]
    pub max_restart_retries: u32,
    /// 每个 worker 状态的轮询时限
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
}

fn default_max_restart_retries() -> u32 {
    3
}

fn default_status_poll_ms() -> u64 {
    50
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 0.0,
            max_steps_per_sec: 0.0,
            periodic_restart_time_min: 0.0,
            force_launch: false,
            with_view_hierarchy: false,
            max_restart_retries: default_max_restart_retries(),
            status_poll_ms: default_status_poll_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_secs > 0.0).then(|| Duration::from_secs_f64(self.step_timeout_secs))
    }

    /// 两步之间的最小间隔
    pub fn min_step_interval(&self) -> Option<Duration> {
        (self.max_steps_per_sec > 0.0).then(|| Duration::from_secs_f64(1.0 / self.max_steps_per_sec))
    }

    pub fn periodic_restart(&self) -> Option<Duration> {
        (self.periodic_restart_time_min > 0.0)
            .then(|| Duration::from_secs_f64(self.periodic_restart_time_min * 60.0))
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

/// 门控配置：`{ triggers = ["on_lift", "on_step"], threshold = 4 }`
#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub threshold: f64,
}

impl GateConfig {
    fn every_lift() -> Self {
        Self {
            triggers: vec![Trigger::OnLift],
            threshold: 0.0,
        }
    }

    pub fn policy(&self) -> Result<GatePolicy, EnvError> {
        GatePolicy::new(self.triggers.iter().copied().collect::<TriggerSet>(), self.threshold)
    }
}

/// [sensors] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SensorsConfig {
    /// UI 状态 watcher 每收到多少次检查命令才真正查询一次
    #[serde(default = "default_ui_state_check_frequency")]
    pub ui_state_check_frequency: u32,
    #[serde(default = "default_max_failed_current_activity")]
    pub max_failed_current_activity: u32,
    /// 连续坏状态上限；0 表示不统计
    #[serde(default = "default_max_bad_states")]
    pub max_bad_states: u32,
    #[serde(default = "default_extras_max_buffer_size")]
    pub extras_max_buffer_size: usize,
    #[serde(default = "GateConfig::every_lift")]
    pub ui_state_gate: GateConfig,
    #[serde(default = "GateConfig::every_lift")]
    pub vision_gate: GateConfig,
}

fn default_ui_state_check_frequency() -> u32 {
    1
}

fn default_max_failed_current_activity() -> u32 {
    10
}

fn default_max_bad_states() -> u32 {
    3
}

fn default_extras_max_buffer_size() -> usize {
    100
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            ui_state_check_frequency: default_ui_state_check_frequency(),
            max_failed_current_activity: default_max_failed_current_activity(),
            max_bad_states: default_max_bad_states(),
            extras_max_buffer_size: default_extras_max_buffer_size(),
            ui_state_gate: GateConfig::every_lift(),
            vision_gate: GateConfig::every_lift(),
        }
    }
}

/// [task] 段：任务定义文件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSection {
    pub path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 MENV__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MENV__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MENV")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::default();
        assert_eq!(config.remote.port, 5000);
        assert_eq!(config.orchestrator.max_restart_retries, 3);
        assert_eq!(config.sensors.extras_max_buffer_size, 100);
        assert!(config.orchestrator.min_step_interval().is_none());
        assert!(config.orchestrator.step_timeout().is_none());
        let policy = config.sensors.vision_gate.policy().unwrap();
        assert!(policy.triggers().contains(Trigger::OnLift));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[remote]
address = "10.0.0.2"
resize_to = [320, 640]

[orchestrator]
max_steps_per_sec = 4.0

[sensors]
ui_state_gate = {{ triggers = ["on_lift", "on_step"], threshold = 4 }}
"#
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.remote.address, "10.0.0.2");
        assert_eq!(config.remote.resize_to, Some([320, 640]));
        assert_eq!(config.orchestrator.min_step_interval(), Some(Duration::from_millis(250)));
        let policy = config.sensors.ui_state_gate.policy().unwrap();
        assert!(policy.triggers().contains(Trigger::OnStep));
    }

    #[test]
    fn test_gate_rejects_time_and_step() {
        let gate = GateConfig {
            triggers: vec![Trigger::OnTime, Trigger::OnStep],
            threshold: 1.0,
        };
        assert!(matches!(gate.policy(), Err(EnvError::Config(_))));
    }
}
