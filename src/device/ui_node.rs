//! UI 树节点与 uiautomator XML 读取
//!
//! 只处理 `uiautomator dump` 输出里出现的子集：元素、双引号属性、自闭合标签、
//! `<?xml ...?>` 声明与注释；不处理 CDATA 与 DTD。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::EnvError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UiNode {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<UiNode>,
}

/// 屏幕像素边界 `[left, top, right, bottom]`
pub type Bounds = [f64; 4];

impl UiNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: UiNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// 解析 `bounds="[l,t][r,b]"`
    pub fn bounds(&self) -> Option<Bounds> {
        static BOUNDS: OnceLock<Regex> = OnceLock::new();
        let re = BOUNDS.get_or_init(|| {
            Regex::new(r"^\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]$").expect("static bounds regex")
        });
        let caps = re.captures(self.attr("bounds")?.trim())?;
        let mut out = [0.0; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = caps[i + 1].parse().ok()?;
        }
        Some(out)
    }

    /// 前序遍历的节点总数
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(UiNode::count).sum::<usize>()
    }

    /// 解析 uiautomator XML，返回根元素
    pub fn parse_xml(xml: &str) -> Result<UiNode, EnvError> {
        static TAG: OnceLock<Regex> = OnceLock::new();
        static ATTR: OnceLock<Regex> = OnceLock::new();
        let tag_re = TAG.get_or_init(|| {
            Regex::new(r#"<!--[\s\S]*?-->|<\?[\s\S]*?\?>|<(/?)([A-Za-z_][\w:.-]*)((?:\s+[\w:.-]+\s*=\s*"[^"]*")*)\s*(/?)>"#)
                .expect("static tag regex")
        });
        let attr_re = ATTR.get_or_init(|| {
            Regex::new(r#"([\w:.-]+)\s*=\s*"([^"]*)""#).expect("static attribute regex")
        });

        let mut stack: Vec<UiNode> = Vec::new();
        let mut root: Option<UiNode> = None;

        for caps in tag_re.captures_iter(xml) {
            let Some(name) = caps.get(2) else {
                continue; // 注释或声明
            };
            let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let self_closing = caps.get(4).is_some_and(|m| !m.as_str().is_empty());

            if closing {
                let node = stack
                    .pop()
                    .ok_or_else(|| EnvError::MalformedResponse(format!("unexpected </{}>", name.as_str())))?;
                if node.tag != name.as_str() {
                    return Err(EnvError::MalformedResponse(format!(
                        "mismatched </{}>, open element is <{}>",
                        name.as_str(),
                        node.tag
                    )));
                }
                attach(&mut stack, &mut root, node)?;
                continue;
            }

            let mut node = UiNode::new(name.as_str());
            if let Some(attrs) = caps.get(3) {
                for a in attr_re.captures_iter(attrs.as_str()) {
                    node.attributes.insert(a[1].to_string(), unescape(&a[2]));
                }
            }
            if self_closing {
                attach(&mut stack, &mut root, node)?;
            } else {
                stack.push(node);
            }
        }

        if let Some(open) = stack.last() {
            return Err(EnvError::MalformedResponse(format!("unclosed <{}>", open.tag)));
        }
        root.ok_or_else(|| EnvError::MalformedResponse("no element in UI dump".to_string()))
    }
}

fn attach(stack: &mut [UiNode], root: &mut Option<UiNode>, node: UiNode) -> Result<(), EnvError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(EnvError::MalformedResponse("multiple root elements in UI dump".to_string())),
    }
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" bounds="[0,0][1080,2340]">
    <node index="0" text="Search &amp; find" resource-id="com.example:id/search" class="android.widget.EditText" package="com.example" bounds="[20,100][1060,200]" />
    <!-- toolbar -->
    <node index="1" text="Go" resource-id="com.example:id/go" class="android.widget.Button" package="com.example" bounds="[540,1170][1080,2340]"></node>
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_uiautomator_dump() {
        let root = UiNode::parse_xml(DUMP).unwrap();
        assert_eq!(root.tag, "hierarchy");
        assert_eq!(root.count(), 4);
        let frame = &root.children[0];
        assert_eq!(frame.children.len(), 2);
        assert_eq!(frame.children[0].attr("text"), Some("Search & find"));
        assert_eq!(frame.children[1].bounds(), Some([540.0, 1170.0, 1080.0, 2340.0]));
    }

    #[test]
    fn test_parse_rejects_unbalanced() {
        assert!(UiNode::parse_xml("<hierarchy><node></hierarchy>").is_err());
        assert!(UiNode::parse_xml("<hierarchy>").is_err());
        assert!(UiNode::parse_xml("no xml here").is_err());
    }
}
