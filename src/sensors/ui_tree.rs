//! UI 树 watcher：用选择器在 UI 树中定位元素，抽取属性向量交给视图层级事件源
//!
//! left / top / right / bottom 从 bounds 读取，并按屏幕宽（左右）或高（上下）归一化。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::EnvError;
use crate::device::{ControlChannel, UiNode};
use crate::events::{lock_graph, NodeId, Selector, SharedGraph, SourceKind};
use crate::sensors::worker::{CheckPayload, Sensor, SensorStatus};

struct TreeSource {
    node: NodeId,
    selector: Selector,
    properties: Vec<String>,
}

/// 抽取一个元素的属性向量；`screen` 为 (height, width)
pub fn extract_properties(element: &UiNode, properties: &[String], screen: (u32, u32)) -> Result<Value, EnvError> {
    let (height, width) = (f64::from(screen.0), f64::from(screen.1));
    let mut values = Vec::with_capacity(properties.len());
    for name in properties {
        let edge = match name.as_str() {
            "left" => Some((0, width)),
            "top" => Some((1, height)),
            "right" => Some((2, width)),
            "bottom" => Some((3, height)),
            _ => None,
        };
        let value = match edge {
            Some((i, norm)) => {
                let bounds = element.bounds().ok_or_else(|| {
                    EnvError::MalformedResponse(format!("<{}> has no parsable bounds", element.tag))
                })?;
                if norm <= 0.0 {
                    return Err(EnvError::MalformedResponse("zero screen dimension".to_string()));
                }
                Value::from(bounds[i] / norm)
            }
            None => element
                .attr(name)
                .map_or(Value::Null, |v| Value::String(v.to_string())),
        };
        values.push(value);
    }
    Ok(Value::Array(values))
}

pub struct UiTreeSensor {
    graph: SharedGraph,
    /// 载荷没带 UI 树时直接向设备查询
    channel: Option<Arc<dyn ControlChannel>>,
    sources: Vec<TreeSource>,
}

impl UiTreeSensor {
    pub fn new(graph: SharedGraph, channel: Option<Arc<dyn ControlChannel>>) -> Self {
        let sources = lock_graph(&graph)
            .sources()
            .filter_map(|(id, source)| match source.kind() {
                SourceKind::ViewHierarchy { selector, properties } => Some(TreeSource {
                    node: id,
                    selector: selector.clone(),
                    properties: properties.iter().map(|p| p.name.clone()).collect(),
                }),
                _ => None,
            })
            .collect();
        Self { graph, channel, sources }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn match_events(&self, root: &UiNode, screen: (u32, u32)) -> Result<(), EnvError> {
        let mut stimuli = Vec::new();
        for source in &self.sources {
            for element in source.selector.select(root) {
                stimuli.push((source.node, extract_properties(element, &source.properties, screen)?));
            }
        }
        let mut graph = lock_graph(&self.graph);
        for (node, values) in stimuli {
            graph.set(node, values);
        }
        Ok(())
    }
}

#[async_trait]
impl Sensor for UiTreeSensor {
    fn name(&self) -> &'static str {
        "ui_tree"
    }

    async fn check(&mut self, payload: CheckPayload) -> Result<SensorStatus, EnvError> {
        let Some(screen) = payload.screen_size else {
            return Ok(SensorStatus::DidNotCheck);
        };
        let root = match (payload.ui_tree, &self.channel) {
            (Some(tree), _) => tree,
            (None, Some(channel)) => Arc::new(channel.ui_tree().await?),
            (None, None) => return Ok(SensorStatus::DidNotCheck),
        };
        self.match_events(&root, screen)?;
        Ok(SensorStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventDecl, GraphBuilder, OutputDecls};
    use serde_json::json;
    use std::time::Duration;

    const XML: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.wikihow.wikihowapp" bounds="[0,0][1080,1920]">
    <node index="0" text="How to Bake a Cake" resource-id="com.wikihow.wikihowapp:id/title" class="android.widget.TextView" package="com.wikihow.wikihowapp" bounds="[108,96][972,480]" />
    <node index="1" text="Search" resource-id="com.wikihow.wikihowapp:id/search_src_text" class="android.widget.EditText" package="com.wikihow.wikihowapp" bounds="[0,480][540,960]" />
  </node>
</hierarchy>"#;

    #[derive(serde::Deserialize)]
    struct Doc {
        events: Vec<EventDecl>,
    }

    const EVENTS: &str = r#"
[[events]]
id = "title"
kind = "view_hierarchy"
selector = ['#"com.wikihow.wikihowapp:id/title"']
properties = [{ name = "text", pattern = 'How to (.+)' }, { name = "left" }, { name = "bottom" }]
repeatability = "unlimited"

[[events]]
id = "missing"
kind = "view_hierarchy"
selector = ['#"com.wikihow.wikihowapp:id/nothing"']
properties = [{ name = "text" }]
"#;

    fn setup(channel: Option<Arc<dyn ControlChannel>>) -> (SharedGraph, UiTreeSensor) {
        let doc: Doc = toml::from_str(EVENTS).unwrap();
        let built = GraphBuilder::default().build(&doc.events, &OutputDecls::default()).unwrap();
        let graph = built.graph.into_shared();
        let sensor = UiTreeSensor::new(graph.clone(), channel);
        (graph, sensor)
    }

    #[test]
    fn test_extract_properties_normalizes_edges() {
        let root = UiNode::parse_xml(XML).unwrap();
        let title = &root.children[0].children[0];
        let props: Vec<String> = ["left", "top", "right", "bottom", "text", "checked"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let values = extract_properties(title, &props, (1920, 1080)).unwrap();
        assert_eq!(values, json!([0.1, 0.05, 0.9, 0.25, "How to Bake a Cake", null]));
    }

    #[tokio::test]
    async fn test_ui_tree_sets_matching_sources() {
        let (graph, mut sensor) = setup(None);
        assert_eq!(sensor.source_count(), 2);
        let payload = CheckPayload {
            ui_tree: Some(Arc::new(UiNode::parse_xml(XML).unwrap())),
            screen_size: Some((1920, 1080)),
            ..CheckPayload::default()
        };
        assert_eq!(sensor.check(payload).await.unwrap(), SensorStatus::Ok);

        let mut g = lock_graph(&graph);
        g.snapshot_all();
        let title = g.find("title").unwrap();
        let missing = g.find("missing").unwrap();
        assert_eq!(g.get(title), vec![json!(["How to Bake a Cake", 0.1, 0.25])]);
        assert!(!g.is_set(missing));
    }

    struct XmlChannel;

    #[async_trait]
    impl ControlChannel for XmlChannel {
        async fn execute(&self, _args: &[String], _timeout: Duration) -> Result<Option<String>, EnvError> {
            Ok(Some(format!("{XML}\nUI hierchary dumped to: /dev/tty")))
        }
    }

    #[tokio::test]
    async fn test_ui_tree_falls_back_to_channel() {
        let (graph, mut sensor) = setup(Some(Arc::new(XmlChannel)));
        let no_size = CheckPayload::default();
        assert_eq!(sensor.check(no_size).await.unwrap(), SensorStatus::DidNotCheck);

        let payload = CheckPayload {
            screen_size: Some((1920, 1080)),
            ..CheckPayload::default()
        };
        assert_eq!(sensor.check(payload).await.unwrap(), SensorStatus::Ok);
        let mut g = lock_graph(&graph);
        g.snapshot_all();
        let title = g.find("title").unwrap();
        assert!(g.is_set(title));
    }
}
