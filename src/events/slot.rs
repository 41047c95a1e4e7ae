//! 组合槽：Default / Or / And / Empty
//!
//! 槽本身不持有激活，只在每个窗口第一次被读取时根据子节点计算 is_set 并缓存（latch），
//! 同一窗口内重复读取结果一致。递归求值在 [`EventGraph`](crate::events::EventGraph) 中完成。

use crate::events::graph::NodeId;
use crate::events::source::Repeatability;
use crate::events::transform::{Cast, Reduce, Transform};

/// 组合方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// 透传第一个子节点
    Default,
    /// 任一子节点触发即触发，值按子节点顺序折叠
    Or,
    /// 全部子节点触发才触发，值为各子节点最新值组成的数组
    And,
    /// 永不触发，未配置输出的占位
    Empty,
}

/// 槽的值管线
#[derive(Clone, Debug, Default)]
pub struct SlotPipeline {
    pub transforms: Vec<Transform>,
    pub cast: Cast,
    pub reduce: Reduce,
    /// Concat / Merge 每个 key 保留的最大条目数
    pub buffer_limit: usize,
}

#[derive(Clone, Debug)]
pub struct EventSlot {
    pub kind: SlotKind,
    pub children: Vec<NodeId>,
    pub prerequisites: Vec<NodeId>,
    pub pipeline: SlotPipeline,
    pub repeatability: Repeatability,
    new_window: bool,
    cached: bool,
    last_satisfied: bool,
    ever_set: bool,
}

impl EventSlot {
    pub fn new(kind: SlotKind, children: Vec<NodeId>) -> Self {
        Self {
            kind,
            children,
            prerequisites: Vec::new(),
            pipeline: SlotPipeline {
                buffer_limit: 100,
                ..SlotPipeline::default()
            },
            repeatability: Repeatability::Unlimited,
            new_window: true,
            cached: false,
            last_satisfied: false,
            ever_set: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(SlotKind::Empty, Vec::new())
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<NodeId>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_pipeline(mut self, pipeline: SlotPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_repeatability(mut self, repeatability: Repeatability) -> Self {
        self.repeatability = repeatability;
        self
    }

    /// 本窗口是否已经求值过
    pub(crate) fn cached(&self) -> Option<bool> {
        (!self.new_window).then_some(self.cached)
    }

    /// 写入本窗口的求值结果，按重复策略决定是否上报
    pub(crate) fn latch(&mut self, prerequisites_met: bool, satisfied: bool) -> bool {
        let report = if !prerequisites_met || !satisfied {
            false
        } else {
            match self.repeatability {
                Repeatability::Unlimited => true,
                Repeatability::Last => !self.last_satisfied,
                Repeatability::None => !self.ever_set,
            }
        };
        if prerequisites_met && satisfied {
            self.ever_set = true;
        }
        self.last_satisfied = prerequisites_met && satisfied;
        self.cached = report;
        self.new_window = false;
        report
    }

    pub(crate) fn ever_set_flag(&self) -> bool {
        self.ever_set
    }

    pub(crate) fn start_window(&mut self) {
        self.new_window = true;
    }

    /// 收割后的清理：本窗口剩余时间内视为未触发
    pub(crate) fn clear(&mut self) {
        self.cached = false;
        self.new_window = false;
    }

    pub(crate) fn reset(&mut self) {
        self.ever_set = false;
        self.last_satisfied = false;
        self.cached = false;
        self.new_window = true;
    }
}
