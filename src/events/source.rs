//! 事件源：由单个传感器 worker 喂入的叶子节点
//!
//! 数据流：stimulus -> 去重 -> verify（按来源类型）-> 累积窗口；`snapshot()` 把累积窗口移入可见窗口。
//! 对外的 `is_set` / `get` 只反映上一次 snapshot 的窗口，从不暴露正在累积的半窗口。

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::selector::Selector;

/// 归一化区域 `[x0, y0, x1, y1]`，取值 0~1
pub type Region = [f32; 4];

/// 重复策略：事件源用于去重，组合槽用于抑制重复上报
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeatability {
    /// 拒绝任何曾经触发过的 stimulus（源默认）
    None,
    /// 只拒绝与上一次输入完全相同的 stimulus
    Last,
    /// 不去重（槽默认）
    Unlimited,
}

/// 标量属性比较符
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    #[default]
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn apply_f64(self, actual: f64, expected: f64) -> bool {
        match self {
            Comparison::Eq => actual == expected,
            Comparison::Ne => actual != expected,
            Comparison::Lt => actual < expected,
            Comparison::Le => actual <= expected,
            Comparison::Gt => actual > expected,
            Comparison::Ge => actual >= expected,
        }
    }
}

/// UI 元素属性匹配器
#[derive(Clone, Debug)]
pub enum PropertyMatcher {
    /// 只取值，不约束
    Pure,
    Scalar { cmp: Comparison, value: Value },
    /// 正则搜索属性的字符串形式
    Pattern(Regex),
}

impl PropertyMatcher {
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            PropertyMatcher::Pure => true,
            PropertyMatcher::Pattern(re) => match actual {
                Value::Null => false,
                Value::String(s) => re.is_match(s),
                other => re.is_match(&other.to_string()),
            },
            PropertyMatcher::Scalar { cmp, value } => {
                match (as_number(actual), as_number(value)) {
                    (Some(a), Some(e)) => cmp.apply_f64(a, e),
                    _ => {
                        let same = value_text(actual) == value_text(value);
                        match cmp {
                            Comparison::Eq => same,
                            Comparison::Ne => !same,
                            _ => false,
                        }
                    }
                }
            }
        }
    }
}

/// 具名属性：name 对应 UI 节点属性名（left/top/right/bottom 为几何属性）
#[derive(Clone, Debug)]
pub struct Property {
    pub name: String,
    pub matcher: PropertyMatcher,
}

/// 自由文本回复的匹配方式
#[derive(Clone, Debug)]
pub enum ResponseMatcher {
    /// 多行正则，载荷为捕获组
    Regex(Regex),
    /// 归一化编辑距离相似度，0~1，总是通过
    Similarity,
    /// 同上，缩放到 0~100
    Fuzz,
}

/// 事件源类型（封闭集合），每种类型自带 verify 规则
#[derive(Clone, Debug)]
pub enum SourceKind {
    Text {
        expect: Regex,
        region: Region,
        needs_detection: bool,
    },
    Icon {
        class: String,
        region: Region,
        needs_detection: bool,
    },
    IconMatch {
        template: PathBuf,
        region: Region,
        needs_detection: bool,
    },
    ViewHierarchy {
        selector: Selector,
        properties: Vec<Property>,
    },
    Log {
        filters: Vec<String>,
        pattern: Regex,
    },
    Response {
        reference: String,
        matcher: ResponseMatcher,
    },
}

impl SourceKind {
    /// 校验 stimulus 并抽取载荷；None 表示未通过
    pub fn verify(&self, stimulus: &Value) -> Option<Value> {
        match self {
            SourceKind::Text { expect, .. } => capture_groups(expect, stimulus.as_str()?),
            SourceKind::Icon { class, .. } => {
                (stimulus.as_str()? == class.as_str()).then_some(Value::Bool(true))
            }
            SourceKind::IconMatch { .. } => stimulus.as_bool()?.then_some(Value::Bool(true)),
            SourceKind::ViewHierarchy { properties, .. } => {
                let values = stimulus.as_array()?;
                if values.len() != properties.len() {
                    return None;
                }
                properties
                    .iter()
                    .zip(values)
                    .all(|(p, v)| p.matcher.matches(v))
                    .then(|| stimulus.clone())
            }
            SourceKind::Log { pattern, .. } => capture_groups(pattern, stimulus.as_str()?),
            SourceKind::Response { reference, matcher } => {
                let text = stimulus.as_str()?;
                match matcher {
                    ResponseMatcher::Regex(re) => capture_groups(re, text),
                    ResponseMatcher::Similarity => {
                        let score = strsim::normalized_levenshtein(text, reference);
                        tracing::info!(score, reference = %reference, "response similarity");
                        Some(Value::from(score))
                    }
                    ResponseMatcher::Fuzz => {
                        let score = strsim::normalized_levenshtein(text, reference) * 100.0;
                        tracing::info!(score, reference = %reference, "response fuzz ratio");
                        Some(Value::from(score))
                    }
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Text { .. } => "text",
            SourceKind::Icon { .. } => "icon",
            SourceKind::IconMatch { .. } => "icon_match",
            SourceKind::ViewHierarchy { .. } => "view_hierarchy",
            SourceKind::Log { .. } => "log",
            SourceKind::Response { .. } => "response",
        }
    }
}

/// 叶子事件节点
#[derive(Clone, Debug)]
pub struct EventSource {
    kind: SourceKind,
    repeatability: Repeatability,
    /// 最近一次输入（无论是否通过）
    last_input: Option<Value>,
    /// 触发过的输入
    history: Vec<Value>,
    pending: Vec<Value>,
    visible: Vec<Value>,
    ever_set: bool,
}

impl EventSource {
    pub fn new(kind: SourceKind, repeatability: Repeatability) -> Self {
        Self {
            kind,
            repeatability,
            last_input: None,
            history: Vec::new(),
            pending: Vec::new(),
            visible: Vec::new(),
            ever_set: false,
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// 唯一的写入口；返回是否产生了一次激活
    pub fn set(&mut self, stimulus: Value) -> bool {
        let rejected = match self.repeatability {
            Repeatability::None => self.history.contains(&stimulus),
            Repeatability::Last => self.last_input.as_ref() == Some(&stimulus),
            Repeatability::Unlimited => false,
        };
        if rejected {
            return false;
        }
        self.last_input = Some(stimulus.clone());

        match self.kind.verify(&stimulus) {
            Some(payload) => {
                tracing::debug!(kind = self.kind.label(), stimulus = %stimulus, "event source activated");
                self.history.push(stimulus);
                self.pending.push(payload);
                self.ever_set = true;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&mut self) {
        self.visible = std::mem::take(&mut self.pending);
    }

    pub fn is_set(&self) -> bool {
        !self.visible.is_empty()
    }

    pub fn get(&self) -> &[Value] {
        &self.visible
    }

    /// 清空可见窗口（累积窗口不受影响）
    pub fn clear(&mut self) {
        self.visible.clear();
    }

    pub fn is_ever_set(&self) -> bool {
        self.ever_set
    }

    /// 回合间的完整重置：触发标记与历史
    pub fn reset(&mut self) {
        self.ever_set = false;
        self.history.clear();
        self.last_input = None;
    }
}

fn capture_groups(re: &Regex, text: &str) -> Option<Value> {
    let caps = re.captures(text)?;
    Some(Value::Array(
        caps.iter()
            .skip(1)
            .map(|m| m.map_or(Value::Null, |m| Value::String(m.as_str().to_string())))
            .collect(),
    ))
}

/// 数字或可解析为数字的字符串 / 布尔
pub(crate) fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
