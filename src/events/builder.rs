//! 从任务定义构建事件图
//!
//! 两遍解析：第一遍按声明顺序为每个 id 分配句柄，第二遍用句柄连接子节点与前置条件。
//! 因此允许前向引用；引用了未声明的 id、重复 id、或存在环，都在构建期报错。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::core::EnvError;
use crate::events::graph::{EventGraph, NodeId};
use crate::events::selector::Selector;
use crate::events::slot::{EventSlot, SlotKind, SlotPipeline};
use crate::events::source::{
    Comparison, EventSource, Property, PropertyMatcher, Region, Repeatability, ResponseMatcher, SourceKind,
};
use crate::events::transform::{Cast, Reduce, Transform};

/// 单个事件声明
#[derive(Debug, Clone, Deserialize)]
pub struct EventDecl {
    pub id: String,
    #[serde(flatten)]
    pub spec: EventSpec,
    /// 源默认 none，槽默认 unlimited
    #[serde(default)]
    pub repeatability: Option<Repeatability>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub cast: Option<Cast>,
    #[serde(default)]
    pub reduce: Option<Reduce>,
}

fn full_region() -> Region {
    [0.0, 0.0, 1.0, 1.0]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSpec {
    Text {
        expect: String,
        #[serde(default = "full_region")]
        region: Region,
        #[serde(default)]
        needs_detection: bool,
    },
    Icon {
        class: String,
        #[serde(default = "full_region")]
        region: Region,
        #[serde(default)]
        needs_detection: bool,
    },
    IconMatch {
        path: PathBuf,
        #[serde(default = "full_region")]
        region: Region,
        #[serde(default)]
        needs_detection: bool,
    },
    ViewHierarchy {
        selector: Vec<String>,
        #[serde(default)]
        properties: Vec<PropertyDecl>,
    },
    Log {
        #[serde(default)]
        filters: Vec<String>,
        pattern: String,
    },
    Response {
        pattern: String,
        #[serde(default)]
        mode: ResponseMode,
    },
    #[serde(rename = "default")]
    Single { children: Vec<String> },
    Or { children: Vec<String> },
    And { children: Vec<String> },
    Empty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub cmp: Comparison,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Regex,
    #[serde(alias = "difflib")]
    Similarity,
    Fuzz,
}

/// 输出引用：直接写 id，或带额外转换步骤
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputRef {
    Id(String),
    Detailed {
        event: String,
        #[serde(default)]
        transforms: Vec<Transform>,
    },
}

impl OutputRef {
    fn event(&self) -> &str {
        match self {
            OutputRef::Id(id) => id,
            OutputRef::Detailed { event, .. } => event,
        }
    }

    fn transforms(&self) -> &[Transform] {
        match self {
            OutputRef::Id(_) => &[],
            OutputRef::Detailed { transforms, .. } => transforms,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputDecls {
    #[serde(default)]
    pub score: Option<OutputRef>,
    #[serde(default)]
    pub reward: Option<OutputRef>,
    #[serde(default)]
    pub episode_end: Option<OutputRef>,
    #[serde(default)]
    pub extras: Option<OutputRef>,
    #[serde(default)]
    pub json_extras: Option<OutputRef>,
    #[serde(default)]
    pub instruction: Option<OutputRef>,
}

/// 每回合的单例输出槽
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSlots {
    pub score: NodeId,
    pub reward: NodeId,
    pub episode_end: NodeId,
    pub extras: NodeId,
    pub json_extras: NodeId,
    pub instruction: NodeId,
}

pub struct BuiltEvents {
    pub graph: EventGraph,
    pub outputs: OutputSlots,
}

pub struct GraphBuilder {
    buffer_limit: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(100)
    }
}

impl GraphBuilder {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            buffer_limit: buffer_limit.max(1),
        }
    }

    pub fn build(&self, decls: &[EventDecl], outputs: &OutputDecls) -> Result<BuiltEvents, EnvError> {
        // 第一遍：分配句柄
        let mut handles: HashMap<&str, NodeId> = HashMap::new();
        for (i, decl) in decls.iter().enumerate() {
            if handles.insert(decl.id.as_str(), NodeId(i)).is_some() {
                return Err(EnvError::EventGraph(format!("duplicate event id '{}'", decl.id)));
            }
        }
        let resolve = |owner: &str, ids: &[String]| -> Result<Vec<NodeId>, EnvError> {
            ids.iter()
                .map(|id| {
                    handles.get(id.as_str()).copied().ok_or_else(|| {
                        EnvError::EventGraph(format!("event '{owner}' references undeclared id '{id}'"))
                    })
                })
                .collect()
        };

        // 第二遍：构建并连线
        let mut graph = EventGraph::new();
        let mut edges: Vec<Vec<NodeId>> = Vec::with_capacity(decls.len());
        for decl in decls {
            let prerequisites = resolve(&decl.id, &decl.prerequisites)?;
            let id = match &decl.spec {
                EventSpec::Single { children } | EventSpec::Or { children } | EventSpec::And { children } => {
                    let kind = match decl.spec {
                        EventSpec::Single { .. } => SlotKind::Default,
                        EventSpec::Or { .. } => SlotKind::Or,
                        _ => SlotKind::And,
                    };
                    let children = resolve(&decl.id, children)?;
                    edges.push(children.iter().chain(&prerequisites).copied().collect());
                    graph.add_slot(decl.id.clone(), self.slot(kind, children, prerequisites, decl))
                }
                EventSpec::Empty => {
                    edges.push(prerequisites.clone());
                    graph.add_slot(decl.id.clone(), self.slot(SlotKind::Empty, Vec::new(), prerequisites, decl))
                }
                spec => {
                    if !prerequisites.is_empty() || !decl.transforms.is_empty() {
                        return Err(EnvError::EventGraph(format!(
                            "event source '{}' cannot carry prerequisites or transforms; wrap it in a slot",
                            decl.id
                        )));
                    }
                    edges.push(Vec::new());
                    let kind = source_kind(&decl.id, spec)?;
                    let repeatability = decl.repeatability.unwrap_or(Repeatability::None);
                    graph.add_source(decl.id.clone(), EventSource::new(kind, repeatability))
                }
            };
            debug_assert_eq!(id.index(), edges.len() - 1);
        }

        if let Some(cycle_at) = find_cycle(&edges) {
            return Err(EnvError::EventGraph(format!(
                "event '{}' depends on itself",
                decls[cycle_at].id
            )));
        }

        let mut folds = FoldInheritance {
            explicit: decls.iter().map(|d| d.reduce.is_some()).collect(),
            assigned: HashMap::new(),
        };
        let outputs = OutputSlots {
            score: self.output(&mut graph, &handles, &mut folds, "score", outputs.score.as_ref(), Cast::Float, Reduce::Latest, &[])?,
            reward: self.output(&mut graph, &handles, &mut folds, "reward", outputs.reward.as_ref(), Cast::Float, Reduce::Sum, &[])?,
            episode_end: self.output(
                &mut graph,
                &handles,
                &mut folds,
                "episode_end",
                outputs.episode_end.as_ref(),
                Cast::None,
                Reduce::Latest,
                &[],
            )?,
            extras: self.output(&mut graph, &handles, &mut folds, "extras", outputs.extras.as_ref(), Cast::None, Reduce::Merge, &[])?,
            json_extras: self.output(
                &mut graph,
                &handles,
                &mut folds,
                "json_extras",
                outputs.json_extras.as_ref(),
                Cast::None,
                Reduce::Merge,
                &[Transform::Json],
            )?,
            instruction: self.output(
                &mut graph,
                &handles,
                &mut folds,
                "instruction",
                outputs.instruction.as_ref(),
                Cast::None,
                Reduce::Concat,
                &[],
            )?,
        };

        tracing::info!(nodes = graph.len(), "event graph built");
        Ok(BuiltEvents { graph, outputs })
    }

    fn slot(&self, kind: SlotKind, children: Vec<NodeId>, prerequisites: Vec<NodeId>, decl: &EventDecl) -> EventSlot {
        EventSlot::new(kind, children)
            .with_prerequisites(prerequisites)
            .with_pipeline(SlotPipeline {
                transforms: decl.transforms.clone(),
                cast: decl.cast.unwrap_or_default(),
                reduce: decl.reduce.unwrap_or_default(),
                buffer_limit: self.buffer_limit,
            })
            .with_repeatability(decl.repeatability.unwrap_or(Repeatability::Unlimited))
    }

    /// 输出槽：以 Default 包裹被引用节点，带上该输出的类型与折叠方式；未配置时为 Empty
    ///
    /// 没有尾部转换的输出把折叠方式下传给被引用的槽及其子槽（显式声明了 reduce 的除外），
    /// 否则子槽先按 latest 折叠，同一窗口内的多次激活会丢失。
    #[allow(clippy::too_many_arguments)]
    fn output(
        &self,
        graph: &mut EventGraph,
        handles: &HashMap<&str, NodeId>,
        folds: &mut FoldInheritance,
        role: &str,
        reference: Option<&OutputRef>,
        cast: Cast,
        reduce: Reduce,
        trailing: &[Transform],
    ) -> Result<NodeId, EnvError> {
        let label = format!("<{role}>");
        let Some(reference) = reference else {
            return Ok(graph.add_slot(label, EventSlot::empty()));
        };
        let target = handles.get(reference.event()).copied().ok_or_else(|| {
            EnvError::EventGraph(format!("output '{role}' references undeclared id '{}'", reference.event()))
        })?;
        if trailing.is_empty() && reduce != Reduce::Latest {
            folds.apply(graph, target, role, reduce);
        }
        let transforms = reference.transforms().iter().chain(trailing).cloned().collect();
        let slot = EventSlot::new(SlotKind::Default, vec![target]).with_pipeline(SlotPipeline {
            transforms,
            cast,
            reduce,
            buffer_limit: self.buffer_limit,
        });
        Ok(graph.add_slot(label, slot))
    }
}

/// 输出折叠方式向下继承的记录；槽的下标与声明下标一致
struct FoldInheritance {
    explicit: Vec<bool>,
    assigned: HashMap<usize, (String, Reduce)>,
}

impl FoldInheritance {
    fn apply(&mut self, graph: &mut EventGraph, root: NodeId, role: &str, reduce: Reduce) {
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) || self.explicit.get(id.index()).copied().unwrap_or(true) {
                continue;
            }
            let Some(slot) = graph.slot_mut(id) else {
                continue;
            };
            match self.assigned.get(&id.index()) {
                Some((owner, inherited)) if *inherited != reduce => {
                    tracing::warn!(
                        event = id.index(),
                        output = role,
                        kept = %owner,
                        "slot shared by outputs with different folds, keeping the first"
                    );
                    continue;
                }
                Some(_) => {}
                None => {
                    slot.pipeline.reduce = reduce;
                    self.assigned.insert(id.index(), (role.to_string(), reduce));
                }
            }
            stack.extend(slot.children.iter().copied());
        }
    }
}

fn compile(id: &str, pattern: &str) -> Result<Regex, EnvError> {
    Regex::new(pattern).map_err(|e| EnvError::EventGraph(format!("event '{id}': invalid pattern: {e}")))
}

fn source_kind(id: &str, spec: &EventSpec) -> Result<SourceKind, EnvError> {
    Ok(match spec {
        EventSpec::Text {
            expect,
            region,
            needs_detection,
        } => SourceKind::Text {
            expect: compile(id, expect)?,
            region: *region,
            needs_detection: *needs_detection,
        },
        EventSpec::Icon {
            class,
            region,
            needs_detection,
        } => SourceKind::Icon {
            class: class.clone(),
            region: *region,
            needs_detection: *needs_detection,
        },
        EventSpec::IconMatch {
            path,
            region,
            needs_detection,
        } => SourceKind::IconMatch {
            template: path.clone(),
            region: *region,
            needs_detection: *needs_detection,
        },
        EventSpec::ViewHierarchy { selector, properties } => {
            if selector.is_empty() {
                return Err(EnvError::EventGraph(format!("event '{id}': empty selector list")));
            }
            let selector = Selector::parse_all(selector)?;
            let properties = properties
                .iter()
                .map(|p| {
                    let matcher = match (&p.pattern, &p.value) {
                        (Some(pattern), _) => PropertyMatcher::Pattern(compile(id, pattern)?),
                        (None, Some(value)) => PropertyMatcher::Scalar {
                            cmp: p.cmp,
                            value: value.clone(),
                        },
                        (None, None) => PropertyMatcher::Pure,
                    };
                    Ok(Property {
                        name: p.name.clone(),
                        matcher,
                    })
                })
                .collect::<Result<Vec<_>, EnvError>>()?;
            SourceKind::ViewHierarchy { selector, properties }
        }
        EventSpec::Log { filters, pattern } => SourceKind::Log {
            filters: filters.clone(),
            pattern: compile(id, pattern)?,
        },
        EventSpec::Response { pattern, mode } => SourceKind::Response {
            reference: pattern.clone(),
            matcher: match mode {
                ResponseMode::Regex => ResponseMatcher::Regex(compile(id, &format!("(?m){pattern}"))?),
                ResponseMode::Similarity => ResponseMatcher::Similarity,
                ResponseMode::Fuzz => ResponseMatcher::Fuzz,
            },
        },
        EventSpec::Single { .. } | EventSpec::Or { .. } | EventSpec::And { .. } | EventSpec::Empty => {
            return Err(EnvError::EventGraph(format!("event '{id}' is not a source")));
        }
    })
}

/// 三色 DFS 找环，返回环上任一节点下标
fn find_cycle(edges: &[Vec<NodeId>]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(i: usize, edges: &[Vec<NodeId>], marks: &mut [Mark]) -> Option<usize> {
        marks[i] = Mark::Grey;
        for next in &edges[i] {
            match marks[next.index()] {
                Mark::Grey => return Some(next.index()),
                Mark::White => {
                    if let Some(c) = visit(next.index(), edges, marks) {
                        return Some(c);
                    }
                }
                Mark::Black => {}
            }
        }
        marks[i] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; edges.len()];
    (0..edges.len()).find_map(|i| {
        if marks[i] == Mark::White {
            visit(i, edges, &mut marks)
        } else {
            None
        }
    })
}
