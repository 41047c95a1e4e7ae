//! 回合编排器：主控循环
//!
//! 负责：独占设备、按步执行动作并取观测、按门控派发传感器检查、快照并收割输出、
//! 回合 reset、有界重试的重启流程、周期重启、帧率节流与步间超时。
//! 只有重启次数耗尽（Escalate）会以 Err 离开编排器；其余失败记入具名计数器后在本地消化。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, OrchestratorConfig, SensorsConfig};
use crate::core::counters::{Counters, RestartCause, EPISODE_STEPS, RESTART_COUNT, TOTAL_STEPS};
use crate::core::gate::GateTracker;
use crate::core::state::{ActuatorState, EpisodePhase, StepOutcome};
use crate::core::task::EpisodeTask;
use crate::core::{EnvError, RecoveryAction, RecoveryEngine};
use crate::device::{Action, ActionType, Actuator, ControlChannel, LogStream, RemoteActuator, RemoteTransport};
use crate::sensors::{CheckPayload, NullRecognizer};
use crate::task::{ScriptedSetup, TaskDefinition};

pub struct Orchestrator {
    actuator: Arc<dyn Actuator>,
    task: EpisodeTask,
    config: OrchestratorConfig,
    ui_state_gate: GateTracker,
    vision_gate: GateTracker,
    counters: Counters,
    recovery: RecoveryEngine,
    channel: Option<Arc<dyn ControlChannel>>,
    /// (height, width)
    screen_size: Option<(u32, u32)>,
    should_restart: bool,
    latest_observation: Option<Instant>,
    phase: EpisodePhase,
}

impl Orchestrator {
    /// 门控策略在构造时校验；设备尚未启动，先调用 `start`
    pub fn new(
        actuator: Arc<dyn Actuator>,
        task: EpisodeTask,
        config: OrchestratorConfig,
        sensors: &SensorsConfig,
    ) -> Result<Self, EnvError> {
        Ok(Self {
            actuator,
            task,
            config,
            ui_state_gate: GateTracker::new(sensors.ui_state_gate.policy()?),
            vision_gate: GateTracker::new(sensors.vision_gate.policy()?),
            counters: Counters::new(),
            recovery: RecoveryEngine::new(),
            channel: None,
            screen_size: None,
            should_restart: false,
            latest_observation: None,
            phase: EpisodePhase::Terminal,
        })
    }

    /// 首次启动设备并完成任务 setup
    pub async fn start(&mut self) -> Result<(), EnvError> {
        self.restart_actuator().await
    }

    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    pub fn task_description(&self) -> &str {
        self.task.description()
    }

    pub fn vocabulary(&self) -> &[String] {
        self.task.vocabulary()
    }

    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    pub fn actuator_state(&self) -> ActuatorState {
        if self.actuator.is_launched() {
            ActuatorState::Launched
        } else {
            ActuatorState::NotLaunched
        }
    }

    pub fn should_restart(&self) -> bool {
        self.should_restart
    }

    /// 全部具名计数器的快照
    pub fn logs(&self) -> BTreeMap<String, u64> {
        self.counters.snapshot()
    }

    /// 新回合：必要时先重启，清零回合计数，抬起所有手指，再 reset 任务
    pub async fn reset_environment_state(&mut self) -> Result<(), EnvError> {
        if self.should_restart || self.should_periodic_restart() {
            self.restart_actuator().await?;
        }

        self.latest_observation = None;
        self.counters.reset_episode();
        self.ui_state_gate.reset();
        self.vision_gate.reset();

        if let Err(e) = self.actuator.send_action(&[Action::lift()]).await {
            tracing::error!(error = %e, "failed to lift fingers on reset");
            self.mark_restart(RestartCause::ExecuteAction, &e);
        }

        if let Err(e) = self.task.reset_task().await {
            tracing::error!(error = %e, "task reset failed");
            self.mark_restart(RestartCause::SimulatorReset, &e);
        }

        self.refresh_screen_size().await;
        self.phase = EpisodePhase::Idle;
        tracing::info!(task = %self.task.id(), "environment reset");
        Ok(())
    }

    /// 执行一步；`None`（或空批次）表示不动作只取观测
    pub async fn execute_action(&mut self, actions: Option<Vec<Action>>) -> Result<StepOutcome, EnvError> {
        let actions = actions.filter(|a| !a.is_empty());
        self.task.increment_steps();
        if actions.is_some() {
            self.counters.incr(TOTAL_STEPS);
            self.counters.incr(EPISODE_STEPS);
        }

        if self.should_restart || self.step_timed_out() {
            return Ok(self.end_episode());
        }
        self.phase = EpisodePhase::Stepping;

        let (is_lift, is_text) = match &actions {
            Some(actions) => {
                if let Err(e) = self.dispatch(actions).await {
                    tracing::error!(error = %e, "failed to execute action");
                    self.mark_restart(RestartCause::ExecuteAction, &e);
                    return Ok(self.end_episode());
                }
                let last = actions.last().map(|a| a.action_type);
                (last == Some(ActionType::Lift), last == Some(ActionType::Text))
            }
            None => (true, false),
        };

        self.throttle().await;

        // 步间超时与节流都从发起取观测的时刻算起
        self.latest_observation = Some(Instant::now());
        let mut observation = match self.actuator.get_observation().await {
            Ok(observation) => observation,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch observation");
                self.mark_restart(RestartCause::FetchObservation, &e);
                return Ok(self.end_episode());
            }
        };

        if is_lift && self.config.with_view_hierarchy {
            if let Some(channel) = &self.channel {
                match channel.ui_tree().await {
                    Ok(tree) => observation.view_hierarchy = Some(Arc::new(tree)),
                    Err(e) => tracing::warn!(error = %e, "failed to fetch view hierarchy"),
                }
            }
        }

        let now = Instant::now();
        let ui_state_due = self.ui_state_gate.evaluate(is_lift, is_text, now);
        let vision_due = self.vision_gate.evaluate(is_lift, is_text, now);
        let payload = CheckPayload {
            screenshot: Some(observation.pixels.clone()),
            ui_tree: observation.view_hierarchy.clone(),
            screen_size: self.screen_size,
        };
        let report = self
            .task
            .run_checks(
                ui_state_due,
                vision_due,
                payload,
                self.config.status_poll(),
                &mut self.counters,
            )
            .await;
        if !report.pending.is_empty() {
            tracing::debug!(pending = ?report.pending, "sensor statuses deferred");
        }

        self.task.snapshot();
        let harvest = self.task.harvest();
        let end = self.task.check_if_episode_ended(report.exited, &mut self.counters);
        if end.restart {
            self.should_restart = true;
        }
        self.task.clear_events();

        if end.ended {
            self.phase = EpisodePhase::Terminal;
        }
        Ok(StepOutcome {
            observation: Some(observation),
            reward: harvest.reward,
            extras: harvest.extras,
            instructions: harvest.instructions,
            episode_end: end.ended,
        })
    }

    /// 停止 worker 并关闭设备
    pub async fn close(&mut self) -> Result<(), EnvError> {
        self.task.close().await;
        self.actuator.close().await
    }

    /// 文本动作逐词交给任务层，回复直接投递给回复类事件源，其余成批交给设备
    async fn dispatch(&mut self, actions: &[Action]) -> Result<(), EnvError> {
        let mut device_actions = Vec::with_capacity(actions.len());
        for action in actions {
            if let Some(text) = action.response_text() {
                self.task.deliver_response(text);
                continue;
            }
            match (action.action_type, action.input_token) {
                (ActionType::Text, Some(token)) => {
                    if !device_actions.is_empty() {
                        self.actuator.send_action(&device_actions).await?;
                        device_actions.clear();
                    }
                    self.task.send_token(token).await?;
                }
                (ActionType::Text, None) => {
                    tracing::warn!("text action without input token ignored");
                }
                _ => device_actions.push(action.clone()),
            }
        }
        if !device_actions.is_empty() {
            self.actuator.send_action(&device_actions).await?;
        }
        Ok(())
    }

    fn end_episode(&mut self) -> StepOutcome {
        self.phase = EpisodePhase::Terminal;
        StepOutcome::ended()
    }

    /// 按错误分类决定是否置待重启，并记入对应原因的计数器
    fn mark_restart(&mut self, cause: RestartCause, err: &EnvError) {
        match self.recovery.handle(err) {
            RecoveryAction::Restart | RecoveryAction::Escalate => {
                self.counters.incr_restart(cause);
                self.should_restart = true;
            }
            RecoveryAction::EndEpisode | RecoveryAction::Absorb => {
                tracing::warn!(%cause, error = %err, "failure absorbed without restart");
            }
        }
    }

    fn step_timed_out(&mut self) -> bool {
        let (Some(timeout), Some(latest)) = (self.config.step_timeout(), self.latest_observation) else {
            return false;
        };
        if latest.elapsed() <= timeout {
            return false;
        }
        tracing::error!(
            elapsed_secs = latest.elapsed().as_secs_f64(),
            timeout_secs = timeout.as_secs_f64(),
            "step timed out"
        );
        self.counters.incr_restart(RestartCause::StepTimeout);
        self.should_restart = true;
        true
    }

    /// 睡到距上次观测满足最小间隔
    async fn throttle(&self) {
        let (Some(interval), Some(latest)) = (self.config.min_step_interval(), self.latest_observation) else {
            return;
        };
        let elapsed = latest.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }

    fn should_periodic_restart(&mut self) -> bool {
        let (Some(threshold), Some(uptime)) = (self.config.periodic_restart(), self.actuator.uptime()) else {
            return false;
        };
        if uptime <= threshold {
            return false;
        }
        tracing::info!(
            uptime_min = uptime.as_secs_f64() / 60.0,
            threshold_min = self.config.periodic_restart_time_min,
            "periodic restart due"
        );
        self.counters.incr_restart(RestartCause::Periodic);
        true
    }

    /// 有界重试：启动 / 重启设备、建立控制通道与日志流，再跑任务 setup
    ///
    /// 每次失败按失败的那一步记入原因计数器并重试整个流程；耗尽后返回 TooManyRestarts。
    async fn restart_actuator(&mut self) -> Result<(), EnvError> {
        self.should_restart = false;
        self.counters.incr(RESTART_COUNT);
        let max_retries = self.config.max_restart_retries.max(1);

        for attempt in 1..=max_retries {
            tracing::info!(attempt, max_retries, "restarting actuator");

            let (channel, log_stream) = match self.launch().await {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::error!(attempt, error = %e, "actuator launch failed");
                    self.counters.incr_restart(RestartCause::SimulatorLaunch);
                    continue;
                }
            };

            if let Err(e) = self.task.setup_task(channel, log_stream).await {
                tracing::error!(attempt, error = %e, "task setup failed");
                self.counters.incr_restart(RestartCause::SetupSteps);
                continue;
            }

            self.refresh_screen_size().await;
            tracing::info!(attempt, "actuator ready");
            return Ok(());
        }

        tracing::error!(max_retries, "maximum number of restarts reached");
        Err(EnvError::TooManyRestarts { attempts: max_retries })
    }

    async fn launch(&mut self) -> Result<(Arc<dyn ControlChannel>, Box<dyn LogStream>), EnvError> {
        if self.config.force_launch || !self.actuator.is_launched() {
            self.task.pause_task().await;
            self.actuator.launch().await?;
        }
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => {
                let channel = self.actuator.create_control_channel().await?;
                self.channel = Some(channel.clone());
                channel
            }
        };
        let log_stream = self.actuator.get_log_stream().await?;
        Ok((channel, log_stream))
    }

    async fn refresh_screen_size(&mut self) {
        let Some(channel) = &self.channel else {
            return;
        };
        match channel.screen_dimensions().await {
            Ok(size) => self.screen_size = Some(size),
            Err(e) => tracing::warn!(error = %e, "failed to read screen dimensions"),
        }
    }
}

/// 按配置组装远程设备上的编排器：远程传输、设备、任务与 setup 解释器
pub fn create_orchestrator(
    cfg: &AppConfig,
    task_path: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<Orchestrator, EnvError> {
    let path = task_path
        .or_else(|| cfg.task.path.clone())
        .ok_or_else(|| EnvError::Config("no task definition path configured".to_string()))?;
    let definition = TaskDefinition::load(&path)?;

    let transport = Arc::new(RemoteTransport::from_config(&cfg.remote)?);
    tracing::info!(url = %transport.url_base(), task = %definition.id, "using remote actuator");
    let actuator = Arc::new(RemoteActuator::new(transport, cfg.remote.resize_to));

    let task = EpisodeTask::new(
        definition,
        Arc::new(ScriptedSetup::new()),
        Arc::new(NullRecognizer),
        cfg.sensors.clone(),
        cancel,
    )?;
    Orchestrator::new(actuator, task, cfg.orchestrator.clone(), &cfg.sensors)
}
