//! 日志 watcher：持续读取日志流，把每一行转交给所有日志类事件源
//!
//! 读取任务独立于检查命令常驻运行；检查命令只做健康检查（流是否仍然存活）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::EnvError;
use crate::device::LogStream;
use crate::events::{lock_graph, NodeId, SharedGraph, SourceKind};
use crate::sensors::worker::{spawn_sensor, CheckPayload, Sensor, SensorStatus, WorkerHandle};

/// 所有日志类事件源的节点与过滤器并集（保持首次出现的顺序）
pub fn log_sources(graph: &SharedGraph) -> (Vec<NodeId>, Vec<String>) {
    let graph = lock_graph(graph);
    let mut nodes = Vec::new();
    let mut filters: Vec<String> = Vec::new();
    for (id, source) in graph.sources() {
        if let SourceKind::Log { filters: own, .. } = source.kind() {
            nodes.push(id);
            for f in own {
                if !filters.contains(f) {
                    filters.push(f.clone());
                }
            }
        }
    }
    (nodes, filters)
}

struct LogHealth {
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Sensor for LogHealth {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn check(&mut self, _payload: CheckPayload) -> Result<SensorStatus, EnvError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(SensorStatus::Ok)
        } else {
            Err(EnvError::Transport("log stream closed".to_string()))
        }
    }
}

async fn read_lines(
    mut stream: Box<dyn LogStream>,
    graph: SharedGraph,
    nodes: Vec<NodeId>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                let mut graph = lock_graph(&graph);
                for &node in &nodes {
                    graph.set(node, Value::String(line.clone()));
                }
            }
            Ok(None) => {
                tracing::warn!("log stream ended");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "log stream failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

/// 推送过滤器并启动读取任务与健康检查 worker；二者共用同一个取消令牌
pub async fn start_log_watcher(
    mut stream: Box<dyn LogStream>,
    graph: SharedGraph,
    cancel: CancellationToken,
) -> Result<WorkerHandle, EnvError> {
    let (nodes, filters) = log_sources(&graph);
    stream.set_filters(&filters).await?;
    tracing::info!(sources = nodes.len(), filters = ?filters, "log watcher started");

    let alive = Arc::new(AtomicBool::new(true));
    tokio::spawn(read_lines(stream, graph, nodes, alive.clone(), cancel.clone()));
    Ok(spawn_sensor(LogHealth { alive }, cancel))
}
