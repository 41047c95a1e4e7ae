//! UI 状态 watcher：核对前台 Activity 与 dumpsys 视图层级路径
//!
//! dumpsys 输出按缩进（每级两个空格）建树，在 "View Hierarchy" 节点下逐级用正则匹配直接子节点。
//! 任何一级不匹配都是致命的"玩家离开"，与 Activity 不符区分上报。

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::core::{EnvError, ExitReason};
use crate::device::ControlChannel;
use crate::sensors::worker::{CheckPayload, Sensor, SensorStatus};

/// dumpsys 树（arena，0 号为虚拟根）
#[derive(Debug, Clone)]
pub struct DumpsysTree {
    nodes: Vec<DumpsysNode>,
}

#[derive(Debug, Clone)]
struct DumpsysNode {
    data: String,
    children: Vec<usize>,
}

impl DumpsysTree {
    pub const ROOT: usize = 0;

    /// 按相对缩进建树：缩进更深为子节点，相同为兄弟，更浅则回退到对应层级
    pub fn parse(output: &str) -> Self {
        let mut nodes = vec![DumpsysNode {
            data: String::new(),
            children: Vec::new(),
        }];
        // (缩进, 节点下标)，根的缩进视为 -2
        let mut stack: Vec<(isize, usize)> = vec![(-2, Self::ROOT)];
        for line in output.lines() {
            let line = line.trim_end_matches([' ', '\r']);
            if line.is_empty() {
                continue;
            }
            let stripped = line.trim_start_matches(' ');
            let indent = (line.len() - stripped.len()) as isize;
            while stack.len() > 1 && stack.last().is_some_and(|&(i, _)| i >= indent) {
                stack.pop();
            }
            let parent = stack.last().map_or(Self::ROOT, |&(_, idx)| idx);
            nodes.push(DumpsysNode {
                data: stripped.to_string(),
                children: Vec::new(),
            });
            let idx = nodes.len() - 1;
            nodes[parent].children.push(idx);
            stack.push((indent, idx));
        }
        Self { nodes }
    }

    pub fn data(&self, node: usize) -> &str {
        &self.nodes[node].data
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.nodes[node].children
    }

    /// 先找直接子节点；找不到且 `max_levels > 0` 时逐个子树向下搜索
    pub fn find_child(&self, node: usize, pred: &dyn Fn(&str) -> bool, max_levels: u32) -> Option<usize> {
        let children = self.children(node);
        if let Some(&hit) = children.iter().find(|&&c| pred(self.data(c))) {
            return Some(hit);
        }
        if max_levels == 0 {
            return None;
        }
        children
            .iter()
            .find_map(|&c| self.find_child(c, pred, max_levels - 1))
    }
}

/// 在 dumpsys 输出中找 View Hierarchy，并逐级匹配路径正则（锚定在行首）
pub fn matches_path(dumpsys_output: &str, path: &[Regex], max_levels: u32) -> bool {
    let tree = DumpsysTree::parse(dumpsys_output);
    let Some(mut current) = tree.find_child(DumpsysTree::ROOT, &|d| d.starts_with("View Hierarchy"), max_levels)
    else {
        tracing::error!("View Hierarchy not found in dumpsys output");
        return false;
    };
    for (i, re) in path.iter().enumerate() {
        let pred = |d: &str| re.find(d).is_some_and(|m| m.start() == 0);
        match tree.find_child(current, &pred, 0) {
            Some(child) => current = child,
            None => {
                tracing::error!(level = i, pattern = re.as_str(), node = tree.data(current), "mismatched view hierarchy path");
                return false;
            }
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenCheck {
    Success,
    /// 未配置期望 Activity，跳过
    EmptyExpectedActivity,
    FailedActivityExtraction,
    UnexpectedActivity,
    UnexpectedViewHierarchy,
}

/// 判断当前画面是否仍是任务期望的画面
#[derive(Debug, Clone)]
pub struct AppScreenChecker {
    expected_activity: Option<String>,
    view_hierarchy_path: Vec<Regex>,
}

impl AppScreenChecker {
    pub fn new(expected_activity: Option<String>, view_hierarchy_path: &[String]) -> Result<Self, EnvError> {
        let view_hierarchy_path = view_hierarchy_path
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| EnvError::Config(format!("bad view hierarchy pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            expected_activity: expected_activity.filter(|a| !a.is_empty()),
            view_hierarchy_path,
        })
    }

    pub async fn check(&self, channel: &dyn ControlChannel) -> ScreenCheck {
        let Some(expected) = self.expected_activity.as_deref() else {
            return ScreenCheck::EmptyExpectedActivity;
        };
        let current = match channel.current_activity().await {
            Ok(activity) => activity,
            Err(e) => {
                tracing::debug!(error = %e, "failed to read current activity");
                return ScreenCheck::FailedActivityExtraction;
            }
        };
        if current != expected {
            tracing::error!(current = %current, expected = %expected, "unexpected activity");
            return ScreenCheck::UnexpectedActivity;
        }

        if !self.view_hierarchy_path.is_empty() {
            let package = expected.split('/').next().unwrap_or(expected);
            match channel.activity_dumpsys(package).await {
                Ok(output) if !output.is_empty() => {
                    if !matches_path(&output, &self.view_hierarchy_path, 3) {
                        return ScreenCheck::UnexpectedViewHierarchy;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "failed to dump activity"),
            }
        }
        ScreenCheck::Success
    }
}

/// 每 `check_frequency` 次检查命令真正核对一次画面
pub struct ScreenStateSensor {
    checker: AppScreenChecker,
    channel: Arc<dyn ControlChannel>,
    check_frequency: u32,
    max_failed_activity: u32,
    counter: u32,
    failed_activity: u32,
}

impl ScreenStateSensor {
    pub fn new(
        checker: AppScreenChecker,
        channel: Arc<dyn ControlChannel>,
        check_frequency: u32,
        max_failed_activity: u32,
    ) -> Self {
        Self {
            checker,
            channel,
            check_frequency,
            max_failed_activity,
            counter: 0,
            failed_activity: 0,
        }
    }
}

#[async_trait]
impl Sensor for ScreenStateSensor {
    fn name(&self) -> &'static str {
        "ui_state"
    }

    async fn check(&mut self, _payload: CheckPayload) -> Result<SensorStatus, EnvError> {
        self.counter += 1;
        if self.check_frequency == 0 || self.counter < self.check_frequency {
            return Ok(SensorStatus::DidNotCheck);
        }
        self.counter = 0;

        let status = match self.checker.check(self.channel.as_ref()).await {
            ScreenCheck::FailedActivityExtraction => {
                self.failed_activity += 1;
                tracing::warn!(failures = self.failed_activity, "could not extract current activity");
                if self.failed_activity >= self.max_failed_activity {
                    self.failed_activity = 0;
                    SensorStatus::PlayerExited(ExitReason::Activity)
                } else {
                    SensorStatus::Ok
                }
            }
            ScreenCheck::UnexpectedActivity => SensorStatus::PlayerExited(ExitReason::Activity),
            ScreenCheck::UnexpectedViewHierarchy => SensorStatus::PlayerExited(ExitReason::ViewHierarchy),
            ScreenCheck::Success | ScreenCheck::EmptyExpectedActivity => {
                self.failed_activity = 0;
                SensorStatus::Ok
            }
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const DUMPSYS: &str = "TASK com.example.app id=12
  ACTIVITY com.example.app/.MainActivity 5d1c1a pid=4242
    Local Activity 1a2b3c state:
      mResumed=true
    View Hierarchy:
      DecorView@1c2d3e[MainActivity]
        android.widget.LinearLayout{9f8e7d V.E...... ........ 0,0-1080,1920}
          android.widget.FrameLayout{1a1a1a V.E...... ........ 0,63-1080,1920 #1020002 android:id/content}
        android.view.View{2b2b2b V.ED..... ........ 0,1920-1080,2040 #1020030 android:id/navigationBarBackground}
";

    #[test]
    fn test_dumpsys_tree_by_indentation() {
        let tree = DumpsysTree::parse(DUMPSYS);
        let root_children = tree.children(DumpsysTree::ROOT);
        assert_eq!(root_children.len(), 1);
        let task = root_children[0];
        assert!(tree.data(task).starts_with("TASK"));
        let activity = tree.children(task)[0];
        assert_eq!(tree.children(activity).len(), 2);
        let decor = tree.children(tree.children(activity)[1])[0];
        assert_eq!(tree.children(decor).len(), 2);
    }

    #[test]
    fn test_matches_path() {
        let path = |ps: &[&str]| ps.iter().map(|p| Regex::new(p).unwrap()).collect::<Vec<_>>();
        assert!(matches_path(
            DUMPSYS,
            &path(&["DecorView@.*", "android.widget.LinearLayout.*", "android.widget.FrameLayout.*"]),
            3
        ));
        // 正则锚定在行首
        assert!(!matches_path(DUMPSYS, &path(&["MainActivity"]), 3));
        assert!(!matches_path(DUMPSYS, &path(&["DecorView@.*", "android.widget.FrameLayout.*"]), 3));
        // View Hierarchy 在第 3 层，不允许向下搜索时找不到
        assert!(!matches_path(DUMPSYS, &path(&["DecorView@.*"]), 0));
    }

    struct FakeChannel {
        activities: Mutex<Vec<Result<String, ()>>>,
    }

    #[async_trait]
    impl ControlChannel for FakeChannel {
        async fn execute(&self, _args: &[String], _timeout: Duration) -> Result<Option<String>, EnvError> {
            Ok(Some(DUMPSYS.to_string()))
        }

        async fn current_activity(&self) -> Result<String, EnvError> {
            self.activities
                .lock()
                .unwrap()
                .remove(0)
                .map_err(|_| EnvError::MalformedResponse("no activity".to_string()))
        }
    }

    fn channel(activities: Vec<Result<&str, ()>>) -> Arc<dyn ControlChannel> {
        Arc::new(FakeChannel {
            activities: Mutex::new(activities.into_iter().map(|a| a.map(String::from)).collect()),
        })
    }

    #[tokio::test]
    async fn test_checker_outcomes() {
        let checker = AppScreenChecker::new(
            Some("com.example.app/.MainActivity".to_string()),
            &["DecorView@.*".to_string(), "android.view.View.*".to_string()],
        )
        .unwrap();
        let ch = channel(vec![Ok("com.example.app/.MainActivity"), Ok("com.other/.Main"), Err(())]);
        assert_eq!(checker.check(ch.as_ref()).await, ScreenCheck::Success);
        assert_eq!(checker.check(ch.as_ref()).await, ScreenCheck::UnexpectedActivity);
        assert_eq!(checker.check(ch.as_ref()).await, ScreenCheck::FailedActivityExtraction);

        let empty = AppScreenChecker::new(None, &[]).unwrap();
        assert_eq!(empty.check(ch.as_ref()).await, ScreenCheck::EmptyExpectedActivity);

        let wrong_path =
            AppScreenChecker::new(Some("com.example.app/.MainActivity".to_string()), &["Nope".to_string()]).unwrap();
        let ch = channel(vec![Ok("com.example.app/.MainActivity")]);
        assert_eq!(wrong_path.check(ch.as_ref()).await, ScreenCheck::UnexpectedViewHierarchy);
    }

    #[tokio::test]
    async fn test_sensor_frequency_and_failed_extraction_bound() {
        let checker = AppScreenChecker::new(Some("com.example.app/.MainActivity".to_string()), &[]).unwrap();
        let ch = channel(vec![Err(()), Err(()), Ok("com.other/.Main")]);
        let mut sensor = ScreenStateSensor::new(checker, ch, 2, 2);
        let p = CheckPayload::default;

        assert_eq!(sensor.check(p()).await.unwrap(), SensorStatus::DidNotCheck);
        assert_eq!(sensor.check(p()).await.unwrap(), SensorStatus::Ok);
        assert_eq!(sensor.check(p()).await.unwrap(), SensorStatus::DidNotCheck);
        assert_eq!(
            sensor.check(p()).await.unwrap(),
            SensorStatus::PlayerExited(ExitReason::Activity)
        );
        assert_eq!(sensor.check(p()).await.unwrap(), SensorStatus::DidNotCheck);
        assert_eq!(
            sensor.check(p()).await.unwrap(),
            SensorStatus::PlayerExited(ExitReason::Activity)
        );
    }
}
