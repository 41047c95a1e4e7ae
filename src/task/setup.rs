//! 任务步骤解释器
//!
//! `TaskSetup` 负责把 setup / reset 步骤落到设备上；worker 生命周期由 `EpisodeTask` 管理。
//! 任何一步失败都以 `StepCommand` 上报，由编排器决定是否重启。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::EnvError;
use crate::device::ControlChannel;
use crate::task::definition::SetupStep;

#[async_trait]
pub trait TaskSetup: Send + Sync {
    /// 按顺序执行步骤，遇到第一处失败即返回
    async fn interpret(&self, channel: &dyn ControlChannel, steps: &[SetupStep]) -> Result<(), EnvError>;
}

/// 只认 adb 与 sleep 两种步骤的最小实现
#[derive(Debug, Default, Clone)]
pub struct ScriptedSetup;

impl ScriptedSetup {
    pub fn new() -> Self {
        Self
    }

    async fn run_step(&self, channel: &dyn ControlChannel, step: &SetupStep) -> Result<(), EnvError> {
        match step {
            SetupStep::Sleep { seconds } => {
                if *seconds > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(*seconds)).await;
                }
                Ok(())
            }
            SetupStep::Adb {
                args,
                timeout_sec,
                expect,
            } => {
                let output = channel
                    .execute(args, Duration::from_secs_f64(timeout_sec.max(0.0)))
                    .await
                    .map_err(|e| EnvError::StepCommand(format!("adb {}: {e}", args.join(" "))))?;
                if let Some(expected) = expect {
                    let output = output.unwrap_or_default();
                    if !output.contains(expected.as_str()) {
                        return Err(EnvError::StepCommand(format!(
                            "adb {}: output does not contain '{expected}'",
                            args.join(" ")
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TaskSetup for ScriptedSetup {
    async fn interpret(&self, channel: &dyn ControlChannel, steps: &[SetupStep]) -> Result<(), EnvError> {
        for (i, step) in steps.iter().enumerate() {
            tracing::debug!(step = i, ?step, "running task step");
            self.run_step(channel, step).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ControlChannel for RecordingChannel {
        async fn execute(&self, args: &[String], _timeout: Duration) -> Result<Option<String>, EnvError> {
            self.calls.lock().unwrap().push(args.to_vec());
            if args.first().map(String::as_str) == Some("fail") {
                return Err(EnvError::Transport("device offline".to_string()));
            }
            Ok(Some("Starting: Intent { cmp=com.example/.Main }".to_string()))
        }
    }

    fn adb(args: &[&str], expect: Option<&str>) -> SetupStep {
        SetupStep::Adb {
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_sec: 1.0,
            expect: expect.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let channel = RecordingChannel::default();
        let steps = vec![
            adb(&["shell", "am", "start"], Some("Starting")),
            SetupStep::Sleep { seconds: 0.0 },
            adb(&["shell", "input", "keyevent", "KEYCODE_HOME"], None),
        ];
        ScriptedSetup::new().interpret(&channel, &steps).await.unwrap();
        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][3], "KEYCODE_HOME");
    }

    #[tokio::test]
    async fn test_failure_stops_and_maps_to_step_command() {
        let channel = RecordingChannel::default();
        let steps = vec![adb(&["fail"], None), adb(&["shell", "ls"], None)];
        let err = ScriptedSetup::new().interpret(&channel, &steps).await.unwrap_err();
        assert!(matches!(err, EnvError::StepCommand(_)));
        assert_eq!(channel.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmet_expectation_fails() {
        let channel = RecordingChannel::default();
        let steps = vec![adb(&["shell", "am", "start"], Some("Error"))];
        let err = ScriptedSetup::new().interpret(&channel, &steps).await.unwrap_err();
        assert!(matches!(err, EnvError::StepCommand(msg) if msg.contains("Error")));
    }
}
