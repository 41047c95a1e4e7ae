//! 事件图：所有事件节点的 arena，节点之间以 [`NodeId`] 句柄引用
//!
//! 生产者（传感器 worker）与消费者（编排器）共享同一个 `Arc<Mutex<EventGraph>>`，
//! 锁只在 set / snapshot / get 期间持有，绝不跨 `.await`。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::events::slot::{EventSlot, SlotKind, SlotPipeline};
use crate::events::source::EventSource;
use crate::events::transform::run_pipeline;

/// 节点句柄（arena 下标）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum Node {
    Source(EventSource),
    Slot(EventSlot),
}

/// 传感器一次检查产生的输入
#[derive(Clone, Debug, PartialEq)]
pub enum Stimulus {
    One(NodeId, Value),
    /// 按顺序尝试候选，第一个被接受的生效
    FirstAccepted(NodeId, Vec<Value>),
}

pub type SharedGraph = Arc<Mutex<EventGraph>>;

/// 获取图锁；持锁方 panic 不影响图数据的一致性，直接接管
pub fn lock_graph(graph: &SharedGraph) -> MutexGuard<'_, EventGraph> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, Default)]
pub struct EventGraph {
    nodes: Vec<Node>,
    labels: Vec<String>,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedGraph {
        Arc::new(Mutex::new(self))
    }

    pub fn add_source(&mut self, label: impl Into<String>, source: EventSource) -> NodeId {
        self.push(label.into(), Node::Source(source))
    }

    pub fn add_slot(&mut self, label: impl Into<String>, slot: EventSlot) -> NodeId {
        self.push(label.into(), Node::Slot(slot))
    }

    fn push(&mut self, label: String, node: Node) -> NodeId {
        self.nodes.push(node);
        self.labels.push(label);
        NodeId(self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn label(&self, id: NodeId) -> &str {
        self.labels.get(id.0).map(String::as_str).unwrap_or("?")
    }

    pub fn find(&self, label: &str) -> Option<NodeId> {
        self.labels.iter().position(|l| l == label).map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub(crate) fn slot_mut(&mut self, id: NodeId) -> Option<&mut EventSlot> {
        match self.nodes.get_mut(id.0) {
            Some(Node::Slot(slot)) => Some(slot),
            _ => None,
        }
    }

    /// 所有事件源（按注册顺序）
    pub fn sources(&self) -> impl Iterator<Item = (NodeId, &EventSource)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match n {
            Node::Source(s) => Some((NodeId(i), s)),
            Node::Slot(_) => None,
        })
    }

    pub fn source(&self, id: NodeId) -> Option<&EventSource> {
        match self.nodes.get(id.0) {
            Some(Node::Source(s)) => Some(s),
            _ => None,
        }
    }

    /// 向事件源写入 stimulus；槽不可写
    pub fn set(&mut self, id: NodeId, stimulus: Value) -> bool {
        match self.nodes.get_mut(id.0) {
            Some(Node::Source(s)) => s.set(stimulus),
            _ => {
                tracing::warn!(node = id.0, "set() on a node that is not an event source");
                false
            }
        }
    }

    pub fn apply(&mut self, stimulus: Stimulus) -> bool {
        match stimulus {
            Stimulus::One(id, v) => self.set(id, v),
            Stimulus::FirstAccepted(id, candidates) => candidates.into_iter().any(|v| self.set(id, v)),
        }
    }

    /// 每步一次：所有源的累积窗口移入可见窗口，所有槽开始新窗口
    pub fn snapshot_all(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Source(s) => s.snapshot(),
                Node::Slot(s) => s.start_window(),
            }
        }
    }

    pub fn clear_all(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Source(s) => s.clear(),
                Node::Slot(s) => s.clear(),
            }
        }
    }

    /// 回合间的完整重置
    pub fn reset_all(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Source(s) => s.reset(),
                Node::Slot(s) => s.reset(),
            }
        }
    }

    pub fn is_set(&mut self, id: NodeId) -> bool {
        match self.nodes.get(id.0) {
            Some(Node::Source(s)) => s.is_set(),
            Some(Node::Slot(_)) => self.slot_is_set(id.0),
            None => false,
        }
    }

    pub fn is_ever_set(&mut self, id: NodeId) -> bool {
        match self.nodes.get(id.0) {
            Some(Node::Source(s)) => s.is_ever_set(),
            Some(Node::Slot(slot)) => {
                if !slot.ever_set_flag() {
                    self.slot_is_set(id.0);
                }
                matches!(self.nodes.get(id.0), Some(Node::Slot(s)) if s.ever_set_flag())
            }
            None => false,
        }
    }

    /// 源返回本窗口全部载荷；槽返回折叠后的单个值（未触发时为空）
    pub fn get(&mut self, id: NodeId) -> Vec<Value> {
        let slot = match self.nodes.get(id.0) {
            Some(Node::Source(s)) => return s.get().to_vec(),
            Some(Node::Slot(slot)) => slot.clone(),
            None => return Vec::new(),
        };
        if !self.slot_is_set(id.0) {
            return Vec::new();
        }

        let label = self.label(id).to_string();
        match slot.kind {
            SlotKind::Empty => Vec::new(),
            SlotKind::Default | SlotKind::Or => {
                let children: &[NodeId] = if slot.kind == SlotKind::Default {
                    &slot.children[..slot.children.len().min(1)]
                } else {
                    &slot.children
                };
                let raw: Vec<Value> = children.iter().flat_map(|c| self.get(*c)).collect();
                let values = raw
                    .into_iter()
                    .filter_map(|v| shape(&slot.pipeline, &label, v))
                    .collect::<Vec<_>>();
                match slot.pipeline.reduce.fold_all(values, slot.pipeline.buffer_limit) {
                    Ok(v) => v.into_iter().collect(),
                    Err(e) => {
                        tracing::warn!(event = %label, error = %e, "reduce failed, dropping window value");
                        Vec::new()
                    }
                }
            }
            SlotKind::And => {
                let latest = slot
                    .children
                    .iter()
                    .map(|c| self.get(*c).pop().unwrap_or(Value::Null))
                    .collect();
                shape(&slot.pipeline, &label, Value::Array(latest))
                    .into_iter()
                    .collect()
            }
        }
    }

    fn slot_is_set(&mut self, index: usize) -> bool {
        let (children, prerequisites, kind) = match &self.nodes[index] {
            Node::Slot(slot) => {
                if let Some(cached) = slot.cached() {
                    return cached;
                }
                (slot.children.clone(), slot.prerequisites.clone(), slot.kind)
            }
            Node::Source(s) => return s.is_set(),
        };

        let met = prerequisites.iter().all(|p| self.is_ever_set(*p));
        let satisfied = met
            && match kind {
                SlotKind::Empty => false,
                SlotKind::Default => children.first().is_some_and(|c| self.is_set(*c)),
                SlotKind::Or => children.iter().fold(false, |acc, c| self.is_set(*c) || acc),
                SlotKind::And => {
                    !children.is_empty() && children.iter().fold(true, |acc, c| self.is_set(*c) && acc)
                }
            };

        match &mut self.nodes[index] {
            Node::Slot(slot) => slot.latch(met, satisfied),
            Node::Source(_) => false,
        }
    }
}

/// 单个值走转换管线与类型包装；失败记录并丢弃
fn shape(pipeline: &SlotPipeline, label: &str, value: Value) -> Option<Value> {
    match run_pipeline(&pipeline.transforms, value).and_then(|v| pipeline.cast.apply(v)) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(event = %label, error = %e, "transform failed, dropping value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::source::{Repeatability, SourceKind};
    use crate::events::transform::{Cast, Reduce};
    use regex::Regex;
    use serde_json::json;

    fn log_source(pattern: &str) -> EventSource {
        EventSource::new(
            SourceKind::Log {
                filters: Vec::new(),
                pattern: Regex::new(pattern).unwrap(),
            },
            Repeatability::Unlimited,
        )
    }

    fn two_sources() -> (EventGraph, NodeId, NodeId) {
        let mut g = EventGraph::new();
        let a = g.add_source("a", log_source(r"a=(\d+)"));
        let b = g.add_source("b", log_source(r"b=(\d+)"));
        (g, a, b)
    }

    #[test]
    fn test_or_is_set_iff_any_child() {
        for (fire_a, fire_b) in [(false, false), (true, false), (false, true), (true, true)] {
            let (mut g, a, b) = two_sources();
            let or = g.add_slot("or", EventSlot::new(SlotKind::Or, vec![a, b]));
            if fire_a {
                g.set(a, json!("a=1"));
            }
            if fire_b {
                g.set(b, json!("b=2"));
            }
            g.snapshot_all();
            let expected = g.is_set(a) || g.is_set(b);
            assert_eq!(g.is_set(or), expected);
        }
    }

    #[test]
    fn test_and_is_set_iff_all_children() {
        for (fire_a, fire_b) in [(false, false), (true, false), (false, true), (true, true)] {
            let (mut g, a, b) = two_sources();
            let and = g.add_slot("and", EventSlot::new(SlotKind::And, vec![a, b]));
            if fire_a {
                g.set(a, json!("a=1"));
            }
            if fire_b {
                g.set(b, json!("b=2"));
            }
            g.snapshot_all();
            let expected = g.is_set(a) && g.is_set(b);
            assert_eq!(g.is_set(and), expected);
        }
    }

    #[test]
    fn test_empty_combinators_never_set() {
        let mut g = EventGraph::new();
        let or = g.add_slot("or", EventSlot::new(SlotKind::Or, Vec::new()));
        let and = g.add_slot("and", EventSlot::new(SlotKind::And, Vec::new()));
        let empty = g.add_slot("empty", EventSlot::empty());
        g.snapshot_all();
        assert!(!g.is_set(or));
        assert!(!g.is_set(and));
        assert!(!g.is_set(empty));
        assert!(g.get(empty).is_empty());
    }

    #[test]
    fn test_or_folds_in_child_order() {
        let (mut g, a, b) = two_sources();
        let pipeline = SlotPipeline {
            transforms: vec!["index:0".parse().unwrap()],
            cast: Cast::Float,
            reduce: Reduce::Latest,
            buffer_limit: 100,
        };
        let or = g.add_slot("or", EventSlot::new(SlotKind::Or, vec![a, b]).with_pipeline(pipeline));
        // 到达顺序 b 先于 a，折叠顺序仍按子节点顺序
        g.set(b, json!("b=2"));
        g.set(a, json!("a=1"));
        g.snapshot_all();
        assert_eq!(g.get(or), vec![json!(2.0)]);
    }

    #[test]
    fn test_and_returns_latest_of_each_child() {
        let (mut g, a, b) = two_sources();
        let and = g.add_slot("and", EventSlot::new(SlotKind::And, vec![a, b]));
        g.set(a, json!("a=1"));
        g.set(a, json!("a=3"));
        g.set(b, json!("b=2"));
        g.snapshot_all();
        assert_eq!(g.get(and), vec![json!([["3"], ["2"]])]);
    }

    #[test]
    fn test_get_is_stable_after_snapshot() {
        let (mut g, a, _) = two_sources();
        let slot = g.add_slot("d", EventSlot::new(SlotKind::Default, vec![a]));
        g.set(a, json!("a=7"));
        g.snapshot_all();
        let first = g.get(slot);
        let second = g.get(slot);
        assert_eq!(first, second);
        assert_eq!(g.is_set(slot), g.is_set(slot));
    }

    #[test]
    fn test_unmet_prerequisite_blocks_slot() {
        let (mut g, a, b) = two_sources();
        let slot = g.add_slot(
            "guarded",
            EventSlot::new(SlotKind::Default, vec![a]).with_prerequisites(vec![b]),
        );
        for i in 0..5 {
            g.set(a, json!(format!("a={i}")));
            g.snapshot_all();
            assert!(!g.is_set(slot));
            assert!(g.get(slot).is_empty());
        }
        g.set(b, json!("b=1"));
        g.set(a, json!("a=9"));
        g.snapshot_all();
        assert!(g.is_set(slot));
    }

    #[test]
    fn test_score_latest_reduction() {
        let mut g = EventGraph::new();
        let score = g.add_source("score", log_source(r"score=([\d.]+)"));
        let pipeline = SlotPipeline {
            transforms: vec!["index:0".parse().unwrap()],
            cast: Cast::Float,
            reduce: Reduce::Latest,
            buffer_limit: 100,
        };
        let slot = g.add_slot("score_slot", EventSlot::new(SlotKind::Default, vec![score]).with_pipeline(pipeline));
        g.set(score, json!("score=3.0"));
        g.set(score, json!("score=5.0"));
        g.snapshot_all();
        assert_eq!(g.get(slot), vec![json!(5.0)]);
    }

    #[test]
    fn test_first_accepted_stops_at_first_match() {
        let (mut g, a, _) = two_sources();
        let applied = g.apply(Stimulus::FirstAccepted(
            a,
            vec![json!("nothing"), json!("a=1"), json!("a=2")],
        ));
        assert!(applied);
        g.snapshot_all();
        assert_eq!(g.get(a), vec![json!(["1"])]);
    }

    #[test]
    fn test_clear_hides_window_until_next_snapshot() {
        let (mut g, a, _) = two_sources();
        let slot = g.add_slot("d", EventSlot::new(SlotKind::Default, vec![a]));
        g.set(a, json!("a=1"));
        g.snapshot_all();
        assert!(g.is_set(slot));
        g.clear_all();
        assert!(!g.is_set(slot));
        assert!(!g.is_set(a));
        g.snapshot_all();
        assert!(!g.is_set(slot));
    }
}
