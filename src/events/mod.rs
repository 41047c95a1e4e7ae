//! 事件代数：把异步到达的原始信号组合为稳定的语义输出
//!
//! - **source**: 叶子事件源（文本 / 图标 / 图标匹配 / UI 属性 / 日志 / 自由文本回复）
//! - **slot**: 组合槽（Default / Or / And / Empty）
//! - **transform**: 槽的值管线（转换步骤、类型包装、窗口内折叠）
//! - **graph**: 节点 arena 与递归求值
//! - **builder**: 从任务定义两遍构建事件图与输出槽
//! - **selector**: UI 树元素选择器

pub mod builder;
pub mod graph;
pub mod selector;
pub mod slot;
pub mod source;
pub mod transform;

pub use builder::{BuiltEvents, EventDecl, GraphBuilder, OutputDecls, OutputSlots};
pub use graph::{lock_graph, EventGraph, Node, NodeId, SharedGraph, Stimulus};
pub use selector::Selector;
pub use slot::{EventSlot, SlotKind, SlotPipeline};
pub use source::{EventSource, Region, Repeatability, SourceKind};
pub use transform::{Cast, Reduce, Transform};
