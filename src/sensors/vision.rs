//! 视觉 watcher：对截图上的候选区域做文本 / 图标识别与图标模板匹配
//!
//! 识别模型本身是外部能力，通过 [`Recognizer`] 注入。区域按截图宽高缩放为像素坐标。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::EnvError;
use crate::device::Screenshot;
use crate::events::{lock_graph, NodeId, Region, SharedGraph, SourceKind, Stimulus};
use crate::sensors::worker::{CheckPayload, Sensor, SensorStatus};

/// 像素坐标框 [x0, y0, x1, y1]
pub type BBox = [f32; 4];

/// 不透明的识别能力；所有方法对每个输入区域按顺序返回一个结果
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// 每个区域返回若干候选文本
    async fn detect_text(&self, screen: &Screenshot, regions: &[BBox]) -> Result<Vec<Vec<String>>, EnvError>;

    async fn recognize_text(&self, screen: &Screenshot, regions: &[BBox]) -> Result<Vec<String>, EnvError>;

    /// 每个区域返回候选框（相对区域左上角）与候选类别
    async fn detect_icons(
        &self,
        screen: &Screenshot,
        regions: &[BBox],
    ) -> Result<(Vec<Vec<BBox>>, Vec<Vec<String>>), EnvError>;

    async fn recognize_icons(&self, screen: &Screenshot, regions: &[BBox]) -> Result<Vec<String>, EnvError>;

    /// 每个模板对应一组候选框，返回逐框是否匹配
    async fn match_icons(
        &self,
        screen: &Screenshot,
        templates: &[PathBuf],
        candidates: &[Vec<BBox>],
    ) -> Result<Vec<Vec<bool>>, EnvError>;
}

/// 什么都识别不到的占位实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecognizer;

#[async_trait]
impl Recognizer for NullRecognizer {
    async fn detect_text(&self, _screen: &Screenshot, regions: &[BBox]) -> Result<Vec<Vec<String>>, EnvError> {
        Ok(vec![Vec::new(); regions.len()])
    }

    async fn recognize_text(&self, _screen: &Screenshot, regions: &[BBox]) -> Result<Vec<String>, EnvError> {
        Ok(vec![String::new(); regions.len()])
    }

    async fn detect_icons(
        &self,
        _screen: &Screenshot,
        regions: &[BBox],
    ) -> Result<(Vec<Vec<BBox>>, Vec<Vec<String>>), EnvError> {
        Ok((vec![Vec::new(); regions.len()], vec![Vec::new(); regions.len()]))
    }

    async fn recognize_icons(&self, _screen: &Screenshot, regions: &[BBox]) -> Result<Vec<String>, EnvError> {
        Ok(vec![String::new(); regions.len()])
    }

    async fn match_icons(
        &self,
        _screen: &Screenshot,
        _templates: &[PathBuf],
        candidates: &[Vec<BBox>],
    ) -> Result<Vec<Vec<bool>>, EnvError> {
        Ok(candidates.iter().map(|c| vec![false; c.len()]).collect())
    }
}

pub fn scale_region(region: &Region, width: u32, height: u32) -> BBox {
    let (w, h) = (width as f32, height as f32);
    [region[0] * w, region[1] * h, region[2] * w, region[3] * h]
}

#[derive(Debug, Default)]
struct Group {
    nodes: Vec<NodeId>,
    regions: Vec<Region>,
    templates: Vec<PathBuf>,
}

impl Group {
    fn push(&mut self, node: NodeId, region: Region, template: Option<PathBuf>) {
        self.nodes.push(node);
        self.regions.push(region);
        self.templates.extend(template);
    }

    fn boxes(&self, screen: &Screenshot) -> Vec<BBox> {
        self.regions
            .iter()
            .map(|r| scale_region(r, screen.width, screen.height))
            .collect()
    }
}

/// 按 (类别, 是否需要检测) 分组的视觉事件源
pub struct VisionSensor {
    recognizer: Arc<dyn Recognizer>,
    graph: SharedGraph,
    text_detect: Group,
    text_recog: Group,
    icon_detect: Group,
    icon_recog: Group,
    match_detect: Group,
    match_plain: Group,
}

impl VisionSensor {
    pub fn new(graph: SharedGraph, recognizer: Arc<dyn Recognizer>) -> Self {
        let mut sensor = Self {
            recognizer,
            graph: graph.clone(),
            text_detect: Group::default(),
            text_recog: Group::default(),
            icon_detect: Group::default(),
            icon_recog: Group::default(),
            match_detect: Group::default(),
            match_plain: Group::default(),
        };
        let g = lock_graph(&graph);
        for (id, source) in g.sources() {
            match source.kind() {
                SourceKind::Text { region, needs_detection, .. } => {
                    let group = if *needs_detection { &mut sensor.text_detect } else { &mut sensor.text_recog };
                    group.push(id, *region, None);
                }
                SourceKind::Icon { region, needs_detection, .. } => {
                    let group = if *needs_detection { &mut sensor.icon_detect } else { &mut sensor.icon_recog };
                    group.push(id, *region, None);
                }
                SourceKind::IconMatch {
                    template,
                    region,
                    needs_detection,
                } => {
                    let group = if *needs_detection { &mut sensor.match_detect } else { &mut sensor.match_plain };
                    group.push(id, *region, Some(template.clone()));
                }
                _ => {}
            }
        }
        drop(g);
        sensor
    }

    pub fn source_count(&self) -> usize {
        [
            &self.text_detect,
            &self.text_recog,
            &self.icon_detect,
            &self.icon_recog,
            &self.match_detect,
            &self.match_plain,
        ]
        .iter()
        .map(|g| g.nodes.len())
        .sum()
    }

    fn apply(&self, stimuli: Vec<Stimulus>) {
        let mut graph = lock_graph(&self.graph);
        for stimulus in stimuli {
            graph.apply(stimulus);
        }
    }

    async fn match_text(&self, screen: &Screenshot) -> Result<(), EnvError> {
        if !self.text_detect.nodes.is_empty() {
            let results = self.recognizer.detect_text(screen, &self.text_detect.boxes(screen)).await?;
            self.apply(
                self.text_detect
                    .nodes
                    .iter()
                    .zip(results)
                    .map(|(&id, cands)| Stimulus::FirstAccepted(id, cands.into_iter().map(Value::String).collect()))
                    .collect(),
            );
        }
        if !self.text_recog.nodes.is_empty() {
            let results = self.recognizer.recognize_text(screen, &self.text_recog.boxes(screen)).await?;
            self.apply(
                self.text_recog
                    .nodes
                    .iter()
                    .zip(results)
                    .map(|(&id, text)| Stimulus::One(id, Value::String(text)))
                    .collect(),
            );
        }
        Ok(())
    }

    async fn match_icons(&self, screen: &Screenshot) -> Result<(), EnvError> {
        if !self.icon_detect.nodes.is_empty() {
            let (_, classes) = self.recognizer.detect_icons(screen, &self.icon_detect.boxes(screen)).await?;
            self.apply(
                self.icon_detect
                    .nodes
                    .iter()
                    .zip(classes)
                    .map(|(&id, cands)| Stimulus::FirstAccepted(id, cands.into_iter().map(Value::String).collect()))
                    .collect(),
            );
        }
        if !self.icon_recog.nodes.is_empty() {
            let results = self.recognizer.recognize_icons(screen, &self.icon_recog.boxes(screen)).await?;
            self.apply(
                self.icon_recog
                    .nodes
                    .iter()
                    .zip(results)
                    .map(|(&id, class)| Stimulus::One(id, Value::String(class)))
                    .collect(),
            );
        }
        Ok(())
    }

    async fn match_templates(&self, screen: &Screenshot) -> Result<(), EnvError> {
        if !self.match_detect.nodes.is_empty() {
            let bases = self.match_detect.boxes(screen);
            let (candidates, _) = self.recognizer.detect_icons(screen, &bases).await?;
            // 候选框相对区域左上角，平移到整图坐标
            let candidates: Vec<Vec<BBox>> = candidates
                .into_iter()
                .zip(&bases)
                .map(|(boxes, base)| {
                    boxes
                        .into_iter()
                        .map(|b| [b[0] + base[0], b[1] + base[1], b[2] + base[0], b[3] + base[1]])
                        .collect()
                })
                .collect();
            let results = self
                .recognizer
                .match_icons(screen, &self.match_detect.templates, &candidates)
                .await?;
            self.apply(
                self.match_detect
                    .nodes
                    .iter()
                    .zip(results)
                    .filter(|(_, hits)| hits.iter().any(|&h| h))
                    .map(|(&id, _)| Stimulus::One(id, Value::Bool(true)))
                    .collect(),
            );
        }
        if !self.match_plain.nodes.is_empty() {
            let candidates: Vec<Vec<BBox>> = self.match_plain.boxes(screen).into_iter().map(|b| vec![b]).collect();
            let results = self
                .recognizer
                .match_icons(screen, &self.match_plain.templates, &candidates)
                .await?;
            self.apply(
                self.match_plain
                    .nodes
                    .iter()
                    .zip(results)
                    .map(|(&id, hits)| Stimulus::One(id, Value::Bool(hits.first().copied().unwrap_or(false))))
                    .collect(),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Sensor for VisionSensor {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn check(&mut self, payload: CheckPayload) -> Result<SensorStatus, EnvError> {
        let Some(screen) = payload.screenshot else {
            return Ok(SensorStatus::DidNotCheck);
        };
        // 一组失败不影响其余组，最后统一上报
        let mut failures = Vec::new();
        if let Err(e) = self.match_text(&screen).await {
            tracing::error!(error = %e, "text recognition failed");
            failures.push(format!("text: {e}"));
        }
        if let Err(e) = self.match_icons(&screen).await {
            tracing::error!(error = %e, "icon recognition failed");
            failures.push(format!("icon: {e}"));
        }
        if let Err(e) = self.match_templates(&screen).await {
            tracing::error!(error = %e, "icon matching failed");
            failures.push(format!("icon_match: {e}"));
        }
        if failures.is_empty() {
            Ok(SensorStatus::Ok)
        } else {
            Ok(SensorStatus::CheckError(failures.join("; ")))
        }
    }
}
