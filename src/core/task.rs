//! 回合任务：持有事件图与四个传感器 worker
//!
//! 负责 worker 生命周期（setup 启动日志 watcher，reset 前后暂停 / 恢复其余三个）、
//! 文本输入、自由文本回复投递、每步检查的派发与收集、输出收割、回合结束判断与坏状态统计。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::SensorsConfig;
use crate::core::counters::{
    Counters, RestartCause, RESET_COUNT_EPISODE_END, RESET_COUNT_MAX_DURATION, RESET_COUNT_PLAYER_EXITED,
};
use crate::core::{EnvError, ExitReason};
use crate::device::{ControlChannel, KeyStroke, LogStream, TextMapper};
use crate::events::source::{as_number, value_text};
use crate::events::transform::merge_objects;
use crate::events::{lock_graph, NodeId, OutputSlots, SharedGraph, SourceKind};
use crate::sensors::{
    spawn_sensor, start_log_watcher, AppScreenChecker, CheckPayload, Recognizer, ScreenStateSensor, SensorStatus,
    UiTreeSensor, VisionSensor, WorkerHandle,
};
use crate::task::{TaskDefinition, TaskSetup};

/// 一步收割到的输出
#[derive(Debug, Default, Clone)]
pub struct Harvest {
    pub reward: f64,
    pub extras: Map<String, Value>,
    pub instructions: Vec<String>,
}

/// 本步检查的汇总
#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub exited: Option<ExitReason>,
    pub check_errors: Vec<&'static str>,
    /// 轮询时限内尚未给出状态的 worker
    pub pending: Vec<&'static str>,
}

impl CheckReport {
    fn record(&mut self, sensor: &'static str, status: SensorStatus, counters: &mut Counters) {
        match status {
            SensorStatus::Ok | SensorStatus::DidNotCheck => {}
            SensorStatus::CheckError(message) => {
                tracing::warn!(sensor, %message, "check error absorbed");
                counters.incr(&format!("check_error_{sensor}"));
                self.check_errors.push(sensor);
            }
            SensorStatus::PlayerExited(reason) => {
                self.exited.get_or_insert(reason);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeEnd {
    pub ended: bool,
    /// 连续坏状态达到上限
    pub restart: bool,
}

pub struct EpisodeTask {
    definition: TaskDefinition,
    setup: Arc<dyn TaskSetup>,
    recognizer: Arc<dyn Recognizer>,
    sensors: SensorsConfig,
    graph: SharedGraph,
    outputs: OutputSlots,
    response_sources: Vec<NodeId>,
    text: TextMapper,
    screen_checker: AppScreenChecker,
    channel: Option<Arc<dyn ControlChannel>>,
    cancel: CancellationToken,
    log_worker: Option<WorkerHandle>,
    screen_worker: Option<WorkerHandle>,
    vision_worker: Option<WorkerHandle>,
    ui_tree_worker: Option<WorkerHandle>,
    latest_score: f64,
    episode_steps: u32,
    episode_start: Instant,
    bad_state_counter: u32,
    is_bad_episode: bool,
}

impl EpisodeTask {
    /// 构建事件图并校验期望画面配置；worker 在 setup / reset 时才启动
    pub fn new(
        definition: TaskDefinition,
        setup: Arc<dyn TaskSetup>,
        recognizer: Arc<dyn Recognizer>,
        sensors: SensorsConfig,
        cancel: CancellationToken,
    ) -> Result<Self, EnvError> {
        let built = definition.build_events(sensors.extras_max_buffer_size)?;
        let graph = built.graph.into_shared();
        let response_sources = lock_graph(&graph)
            .sources()
            .filter(|(_, source)| matches!(source.kind(), SourceKind::Response { .. }))
            .map(|(id, _)| id)
            .collect();
        let screen_checker = AppScreenChecker::new(definition.expected_activity.clone(), &definition.view_hierarchy_path)?;
        let text = TextMapper::new(definition.vocabulary.clone());

        Ok(Self {
            definition,
            setup,
            recognizer,
            sensors,
            graph,
            outputs: built.outputs,
            response_sources,
            text,
            screen_checker,
            channel: None,
            cancel,
            log_worker: None,
            screen_worker: None,
            vision_worker: None,
            ui_tree_worker: None,
            latest_score: 0.0,
            episode_steps: 0,
            episode_start: Instant::now(),
            bad_state_counter: 0,
            is_bad_episode: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn description(&self) -> &str {
        &self.definition.description
    }

    pub fn vocabulary(&self) -> &[String] {
        self.text.vocabulary()
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn episode_steps(&self) -> u32 {
        self.episode_steps
    }

    pub fn bad_state_counter(&self) -> u32 {
        self.bad_state_counter
    }

    /// 设备（重新）就绪后调用：替换控制通道，重启日志 watcher，执行 setup 步骤
    pub async fn setup_task(
        &mut self,
        channel: Arc<dyn ControlChannel>,
        log_stream: Box<dyn LogStream>,
    ) -> Result<(), EnvError> {
        if let Some(worker) = self.log_worker.take() {
            worker.join().await;
        }
        self.channel = Some(channel.clone());
        self.log_worker = Some(start_log_watcher(log_stream, self.graph.clone(), self.cancel.child_token()).await?);
        self.setup.interpret(channel.as_ref(), &self.definition.setup_steps).await?;
        tracing::info!(task = %self.definition.id, "task setup finished");
        Ok(())
    }

    /// 停止 UI 状态 / 视觉 / UI 树三个 worker；日志 watcher 保持运行
    pub async fn pause_task(&mut self) {
        let workers = [
            self.screen_worker.take(),
            self.vision_worker.take(),
            self.ui_tree_worker.take(),
        ];
        for worker in workers.into_iter().flatten() {
            worker.join().await;
        }
    }

    pub fn resume_task(&mut self) {
        if let (None, Some(channel)) = (&self.screen_worker, &self.channel) {
            let sensor = ScreenStateSensor::new(
                self.screen_checker.clone(),
                channel.clone(),
                self.sensors.ui_state_check_frequency,
                self.sensors.max_failed_current_activity,
            );
            self.screen_worker = Some(spawn_sensor(sensor, self.cancel.child_token()));
        }
        if self.vision_worker.is_none() {
            let sensor = VisionSensor::new(self.graph.clone(), self.recognizer.clone());
            if sensor.source_count() > 0 {
                self.vision_worker = Some(spawn_sensor(sensor, self.cancel.child_token()));
            }
        }
        if self.ui_tree_worker.is_none() {
            let sensor = UiTreeSensor::new(self.graph.clone(), self.channel.clone());
            if sensor.source_count() > 0 {
                self.ui_tree_worker = Some(spawn_sensor(sensor, self.cancel.child_token()));
            }
        }
    }

    /// 暂停 worker，执行 reset 步骤，恢复 worker，清空事件图与回合计数
    pub async fn reset_task(&mut self) -> Result<(), EnvError> {
        self.pause_task().await;
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| EnvError::StepCommand("task has not been set up".to_string()))?;
        self.setup.interpret(channel.as_ref(), &self.definition.reset_steps).await?;
        self.resume_task();
        self.reset_counters();
        tracing::info!(task = %self.definition.id, "task reset");
        Ok(())
    }

    fn reset_counters(&mut self) {
        if !self.is_bad_episode {
            self.bad_state_counter = 0;
        }
        self.is_bad_episode = false;
        self.episode_steps = 0;
        self.episode_start = Instant::now();
        self.latest_score = 0.0;
        lock_graph(&self.graph).reset_all();
    }

    pub fn increment_steps(&mut self) {
        self.episode_steps += 1;
    }

    /// 把词表中的一个词逐键输入设备
    pub async fn send_token(&self, token: u32) -> Result<(), EnvError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| EnvError::StepCommand("no control channel for text entry".to_string()))?;
        for stroke in self.text.strokes(token)? {
            match stroke {
                KeyStroke::Text(text) => channel.input_text(&text).await?,
                KeyStroke::Key(key) => channel.input_key(key).await?,
            }
        }
        Ok(())
    }

    /// 自由文本回复直接交给所有回复类事件源
    pub fn deliver_response(&self, text: &str) {
        let mut graph = lock_graph(&self.graph);
        for &node in &self.response_sources {
            graph.set(node, Value::String(text.to_string()));
        }
        tracing::debug!(sources = self.response_sources.len(), "response delivered");
    }

    /// 先对账各 worker 此前迟到的状态，再向到期的 worker 投递检查命令，逐个在 `bound` 内轮询
    ///
    /// 日志 watcher 每步都做健康检查；UI 树与视觉共用同一个门控。
    pub async fn run_checks(
        &mut self,
        ui_state_due: bool,
        vision_due: bool,
        payload: CheckPayload,
        bound: Duration,
        counters: &mut Counters,
    ) -> CheckReport {
        let Self {
            log_worker,
            screen_worker,
            vision_worker,
            ui_tree_worker,
            ..
        } = self;

        let mut report = CheckReport::default();
        let mut dispatched: Vec<&mut WorkerHandle> = Vec::new();
        for (worker, due) in [
            (log_worker, true),
            (screen_worker, ui_state_due),
            (vision_worker, vision_due),
            (ui_tree_worker, vision_due),
        ] {
            let Some(worker) = worker else {
                continue;
            };
            for status in worker.drain_status() {
                tracing::debug!(sensor = worker.name(), ?status, "late status reconciled");
                report.record(worker.name(), status, counters);
            }
            if !due {
                continue;
            }
            if worker.request_check(payload.clone()) {
                dispatched.push(worker);
            } else {
                report.pending.push(worker.name());
            }
        }

        for worker in dispatched {
            let name = worker.name();
            match worker.poll_status(bound).await {
                Some(status) => report.record(name, status, counters),
                None => report.pending.push(name),
            }
        }
        report
    }

    /// 所有节点做一次快照；必须在本步所有 worker 都被轮询之后调用
    pub fn snapshot(&self) {
        lock_graph(&self.graph).snapshot_all();
    }

    /// 清空所有源的激活窗口
    pub fn clear_events(&self) {
        lock_graph(&self.graph).clear_all();
    }

    /// 读取输出槽：分数增量 + 奖励和，extras 与 JSON extras 按 key 合并，指令拼接
    pub fn harvest(&mut self) -> Harvest {
        let outputs = self.outputs;
        let limit = self.sensors.extras_max_buffer_size.max(1);
        let mut graph = lock_graph(&self.graph);

        let mut reward = 0.0;
        if let Some(score) = graph.get(outputs.score).first().and_then(as_number) {
            reward += score - self.latest_score;
            self.latest_score = score;
        }
        if let Some(r) = graph.get(outputs.reward).first().and_then(as_number) {
            reward += r;
        }

        let extras = merge_objects(
            first_object(graph.get(outputs.extras)),
            first_object(graph.get(outputs.json_extras)),
            limit,
        );

        let instructions = graph
            .get(outputs.instruction)
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items,
                other => vec![other],
            })
            .map(|v| value_text(&v))
            .collect();

        Harvest {
            reward,
            extras,
            instructions,
        }
    }

    /// 顺序：玩家离开 > 回合结束事件 > 步数上限 > 时长上限
    pub fn check_if_episode_ended(&mut self, exited: Option<ExitReason>, counters: &mut Counters) -> EpisodeEnd {
        if let Some(reason) = exited {
            tracing::warn!(task = %self.definition.id, %reason, "player exited the expected screen");
            let restart = self.increment_bad_state(counters);
            counters.incr(RESET_COUNT_PLAYER_EXITED);
            return EpisodeEnd { ended: true, restart };
        }

        if lock_graph(&self.graph).is_set(self.outputs.episode_end) {
            tracing::info!(task = %self.definition.id, "episode end event fired");
            counters.incr(RESET_COUNT_EPISODE_END);
            return EpisodeEnd {
                ended: true,
                restart: false,
            };
        }

        let max_steps = self.definition.max_num_steps;
        let over_steps = max_steps > 0 && self.episode_steps > max_steps;
        let max_duration = self.definition.max_duration_sec;
        let over_time = max_duration > 0.0 && self.episode_start.elapsed().as_secs_f64() > max_duration;
        if over_steps || over_time {
            tracing::info!(
                task = %self.definition.id,
                steps = self.episode_steps,
                elapsed_secs = self.episode_start.elapsed().as_secs_f64(),
                "episode reached its step or duration limit"
            );
            counters.incr(RESET_COUNT_MAX_DURATION);
            return EpisodeEnd {
                ended: true,
                restart: false,
            };
        }

        EpisodeEnd::default()
    }

    /// 返回 true 表示连续坏状态达到上限，需要重启
    fn increment_bad_state(&mut self, counters: &mut Counters) -> bool {
        let max = self.sensors.max_bad_states;
        if max == 0 {
            tracing::warn!("bad state ignored, max_bad_states is not set");
            return false;
        }
        self.is_bad_episode = true;
        self.bad_state_counter += 1;
        tracing::warn!(count = self.bad_state_counter, max, "bad state detected");
        if self.bad_state_counter >= max {
            tracing::error!("too many consecutive bad states, restart pending");
            counters.incr_restart(RestartCause::MaxBadStates);
            return true;
        }
        false
    }

    /// 停止全部 worker
    pub async fn close(&mut self) {
        self.pause_task().await;
        if let Some(worker) = self.log_worker.take() {
            worker.join().await;
        }
    }
}

fn first_object(values: Vec<Value>) -> Map<String, Value> {
    match values.into_iter().next() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
