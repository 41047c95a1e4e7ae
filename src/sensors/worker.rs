//! 传感器 worker：一个常驻后台循环 + 深度为 1 的收件箱 / 发件箱
//!
//! 编排器只做三件事：投递检查命令（附带本步载荷）、在短时限内轮询状态、停止。
//! 轮询超时表示"仍在运行"，不是错误。检查出错（含 panic）上报 CheckError，循环继续。
//! 每条命令带递增序号，迟到的旧状态不会被当作本次结果，而是留待下一步对账。
//! 停止是一次性且幂等的：正在检查的 worker 会完成当前检查、丢弃结果后退出。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{EnvError, ExitReason};
use crate::device::{Screenshot, UiNode};

/// 本步交给 worker 的载荷；各 worker 只取自己需要的部分
#[derive(Clone, Debug, Default)]
pub struct CheckPayload {
    pub screenshot: Option<Arc<Screenshot>>,
    pub ui_tree: Option<Arc<UiNode>>,
    /// (height, width)
    pub screen_size: Option<(u32, u32)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SensorStatus {
    Ok,
    DidNotCheck,
    CheckError(String),
    /// 致命：玩家离开了预期画面，结束回合但不重启
    PlayerExited(ExitReason),
}

/// 一类传感器的检查逻辑
#[async_trait]
pub trait Sensor: Send + 'static {
    fn name(&self) -> &'static str;

    /// 执行一次检查；载荷形状不符时返回 DidNotCheck
    async fn check(&mut self, payload: CheckPayload) -> Result<SensorStatus, EnvError>;
}

/// 编排器持有的 worker 句柄
pub struct WorkerHandle {
    name: &'static str,
    commands: mpsc::Sender<(u64, CheckPayload)>,
    status: mpsc::Receiver<(u64, SensorStatus)>,
    /// 最近一次投递成功的命令序号
    requested: u64,
    /// 轮询时收到的旧命令结果
    late: Vec<SensorStatus>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 投递检查命令；上一条命令尚未被取走时返回 false
    pub fn request_check(&mut self, payload: CheckPayload) -> bool {
        match self.commands.try_send((self.requested + 1, payload)) {
            Ok(()) => {
                self.requested += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(sensor = self.name, "previous check still pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// 在 `bound` 内等待最近一次命令的状态；None 表示尚未完成，稍后再对账
    pub async fn poll_status(&mut self, bound: Duration) -> Option<SensorStatus> {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            match tokio::time::timeout_at(deadline, self.status.recv()).await {
                Ok(Some((seq, status))) if seq == self.requested => return Some(status),
                Ok(Some((seq, status))) => {
                    tracing::debug!(sensor = self.name, seq, current = self.requested, "late status kept for reconciliation");
                    self.late.push(status);
                }
                Ok(None) => return None,
                Err(_) => {
                    tracing::debug!(sensor = self.name, "status not ready");
                    return None;
                }
            }
        }
    }

    /// 取走此前各步迟到的状态；须在投递新命令之前调用
    pub fn drain_status(&mut self) -> Vec<SensorStatus> {
        let mut late = std::mem::take(&mut self.late);
        while let Ok((_, status)) = self.status.try_recv() {
            late.push(status);
        }
        late
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// 幂等
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// 停止并等待循环退出
    pub async fn join(mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::warn!(sensor = self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 启动 worker 循环；`cancel` 取消时循环退出
pub fn spawn_sensor<S: Sensor>(mut sensor: S, cancel: CancellationToken) -> WorkerHandle {
    let name = sensor.name();
    let (command_tx, mut command_rx) = mpsc::channel::<(u64, CheckPayload)>(1);
    let (status_tx, status_rx) = mpsc::channel::<(u64, SensorStatus)>(1);
    let token = cancel.clone();

    let join = tokio::spawn(async move {
        tracing::debug!(sensor = name, "worker started");
        loop {
            let (seq, payload) = tokio::select! {
                _ = token.cancelled() => break,
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let status = match AssertUnwindSafe(sensor.check(payload)).catch_unwind().await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    tracing::warn!(sensor = name, error = %e, "check failed");
                    SensorStatus::CheckError(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(sensor = name, "check panicked");
                    SensorStatus::CheckError("check panicked".to_string())
                }
            };

            if token.is_cancelled() {
                tracing::debug!(sensor = name, "stopped mid-check, result discarded");
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                sent = status_tx.send((seq, status)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(sensor = name, "worker stopped");
    });

    WorkerHandle {
        name,
        commands: command_tx,
        status: status_rx,
        requested: 0,
        late: Vec::new(),
        cancel,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedSensor {
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    #[async_trait]
    impl Sensor for ScriptedSensor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn check(&mut self, payload: CheckPayload) -> Result<SensorStatus, EnvError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if payload.screen_size.is_none() {
                return Ok(SensorStatus::DidNotCheck);
            }
            match n {
                2 => Err(EnvError::Transport("boom".to_string())),
                3 => panic!("recognizer crashed"),
                _ => Ok(SensorStatus::Ok),
            }
        }
    }

    fn payload() -> CheckPayload {
        CheckPayload {
            screen_size: Some((1920, 1080)),
            ..CheckPayload::default()
        }
    }

    #[tokio::test]
    async fn test_worker_reports_and_survives_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut handle = spawn_sensor(
            ScriptedSensor {
                calls: calls.clone(),
                delay: Duration::ZERO,
            },
            CancellationToken::new(),
        );
        let bound = Duration::from_secs(1);

        assert!(handle.request_check(payload()));
        assert_eq!(handle.poll_status(bound).await, Some(SensorStatus::Ok));
        assert!(handle.request_check(payload()));
        assert!(matches!(handle.poll_status(bound).await, Some(SensorStatus::CheckError(_))));
        assert!(handle.request_check(payload()));
        assert!(matches!(handle.poll_status(bound).await, Some(SensorStatus::CheckError(_))));
        assert!(handle.request_check(CheckPayload::default()));
        assert_eq!(handle.poll_status(bound).await, Some(SensorStatus::DidNotCheck));
        assert!(handle.is_running());
        handle.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_timeout_is_not_an_error() {
        let mut handle = spawn_sensor(
            ScriptedSensor {
                calls: Arc::new(AtomicU32::new(0)),
                delay: Duration::from_millis(200),
            },
            CancellationToken::new(),
        );
        assert!(handle.request_check(payload()));
        assert_eq!(handle.poll_status(Duration::from_millis(10)).await, None);
        assert_eq!(handle.poll_status(Duration::from_secs(2)).await, Some(SensorStatus::Ok));
        handle.join().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_discards_result() {
        let mut handle = spawn_sensor(
            ScriptedSensor {
                calls: Arc::new(AtomicU32::new(0)),
                delay: Duration::from_millis(100),
            },
            CancellationToken::new(),
        );
        assert!(handle.request_check(payload()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        handle.stop();
        assert_eq!(handle.poll_status(Duration::from_millis(300)).await, None);
        assert!(!handle.is_running());
        handle.join().await;
    }

    /// 每次检查的结果带上调用序号
    struct NumberedSensor {
        calls: u32,
        delay: Duration,
    }

    #[async_trait]
    impl Sensor for NumberedSensor {
        fn name(&self) -> &'static str {
            "numbered"
        }

        async fn check(&mut self, _payload: CheckPayload) -> Result<SensorStatus, EnvError> {
            self.calls += 1;
            tokio::time::sleep(self.delay).await;
            Ok(SensorStatus::CheckError(format!("check {}", self.calls)))
        }
    }

    #[tokio::test]
    async fn test_late_status_is_not_taken_for_current_check() {
        let mut handle = spawn_sensor(
            NumberedSensor {
                calls: 0,
                delay: Duration::from_millis(100),
            },
            CancellationToken::new(),
        );

        assert!(handle.request_check(payload()));
        assert_eq!(handle.poll_status(Duration::from_millis(10)).await, None);
        // 第一次检查仍在进行，第二条命令进入收件箱
        assert!(handle.request_check(payload()));
        assert_eq!(
            handle.poll_status(Duration::from_secs(2)).await,
            Some(SensorStatus::CheckError("check 2".to_string()))
        );
        assert_eq!(
            handle.drain_status(),
            vec![SensorStatus::CheckError("check 1".to_string())]
        );
        assert!(handle.drain_status().is_empty());

        // 未轮询到的结果在下一步之前取回
        assert!(handle.request_check(payload()));
        assert_eq!(handle.poll_status(Duration::from_millis(10)).await, None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            handle.drain_status(),
            vec![SensorStatus::CheckError("check 3".to_string())]
        );
        handle.join().await;
    }
}
