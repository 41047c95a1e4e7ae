//! 运行器的关闭流程：信号监听、关闭原因、清理步骤
//!
//! 所有 worker 的取消令牌都派生自关闭令牌，取消它即停止全部传感器；
//! 设备关闭作为清理步骤在主流程退出后执行。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::Orchestrator;
use crate::core::EnvError;

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    /// 主流程无法继续（重启耗尽、reset 失败等）
    Fatal(String),
}

/// 关闭令牌与首个关闭原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 只记录第一次的原因，重复调用无副作用
    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::info!(?reason, "shutdown requested");
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn listen_for_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    if sigterm.recv().await.is_some() {
                        manager.shutdown(ShutdownReason::Terminated);
                    }
                }
            });
        }
    }
}

#[async_trait::async_trait]
pub trait CleanupStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> Result<(), EnvError>;
}

/// 按注册的逆序执行清理步骤；单步失败或超时不影响后续步骤
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    steps: Vec<Box<dyn CleanupStep>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    /// 设备关闭走长超时，调用方按 launch 超时设置
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn register(&mut self, step: impl CleanupStep + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    /// 返回失败或超时的步骤名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        for step in self.steps.iter().rev() {
            let name = step.name();
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => tracing::info!(step = name, "cleanup finished"),
                Ok(Err(e)) => {
                    tracing::warn!(step = name, error = %e, "cleanup failed");
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(step = name, timeout_secs = self.step_timeout.as_secs_f64(), "cleanup timed out");
                    failed.push(name);
                }
            }
        }
        failed
    }
}

/// 关闭编排器：停止 worker 并关闭设备
pub struct OrchestratorCleanup {
    orchestrator: Arc<tokio::sync::Mutex<Orchestrator>>,
}

impl OrchestratorCleanup {
    pub fn new(orchestrator: Arc<tokio::sync::Mutex<Orchestrator>>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl CleanupStep for OrchestratorCleanup {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    async fn cleanup(&self) -> Result<(), EnvError> {
        self.orchestrator.lock().await.close().await
    }
}

/// 跑主流程直到其结束或收到关闭请求，随后执行清理
///
/// 主流程在关闭请求到达时被直接丢弃，因此它持有的编排器锁会先释放再清理。
pub async fn run_with_graceful_shutdown<Fut>(coordinator: ShutdownCoordinator, app: Fut)
where
    Fut: Future<Output = ()>,
{
    let manager = coordinator.manager().clone();
    manager.listen_for_signals();
    let token = manager.token();

    tokio::select! {
        _ = app => tracing::info!("run finished"),
        _ = token.cancelled() => {
            tracing::info!(reason = ?manager.reason(), "run interrupted");
        }
    }

    let failed = coordinator.run_cleanup().await;
    if !failed.is_empty() {
        tracing::warn!(?failed, "some cleanup steps did not complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins_and_cancels_worker_tokens() {
        let manager = ShutdownManager::new();
        let worker = manager.token().child_token();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Fatal("too many restarts".to_string()));
        manager.shutdown(ShutdownReason::Interrupted);
        assert!(worker.is_cancelled());
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::Fatal("too many restarts".to_string()))
        );
    }

    struct RecordingStep {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CleanupStep for RecordingStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn cleanup(&self) -> Result<(), EnvError> {
            self.order.lock().unwrap().push(self.name);
            if self.fail {
                return Err(EnvError::Transport("daemon gone".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_reverse_order_despite_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .with_step_timeout(Duration::from_secs(1));
        coordinator.register(RecordingStep {
            name: "device",
            order: order.clone(),
            fail: false,
        });
        coordinator.register(RecordingStep {
            name: "workers",
            order: order.clone(),
            fail: true,
        });

        let failed = coordinator.run_cleanup().await;
        assert_eq!(failed, vec!["workers"]);
        assert_eq!(*order.lock().unwrap(), vec!["workers", "device"]);
    }

    #[tokio::test]
    async fn test_shutdown_request_interrupts_run_then_cleans_up() {
        let manager = Arc::new(ShutdownManager::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new(manager.clone());
        coordinator.register(RecordingStep {
            name: "device",
            order: order.clone(),
            fail: false,
        });

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        run_with_graceful_shutdown(coordinator, async move {
            manager.shutdown(ShutdownReason::Fatal("reset failed".to_string()));
            std::future::pending::<()>().await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(*order.lock().unwrap(), vec!["device"]);
    }
}
