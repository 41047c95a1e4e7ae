//! 检查节流门控：每步、每类传感器决定本步是否真的跑检查
//!
//! 触发集合是四种触发的位集：抬手、文本输入、按时间、按步数。时间与步数互斥，
//! 抬手 / 文本与经过时间无关，单独判断。"从未检查过" 用 `None` 表示。

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::EnvError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    OnLift,
    OnText,
    OnTime,
    OnStep,
}

impl Trigger {
    const fn bit(self) -> u8 {
        match self {
            Trigger::OnLift => TriggerSet::ON_LIFT,
            Trigger::OnText => TriggerSet::ON_TEXT,
            Trigger::OnTime => TriggerSet::ON_TIME,
            Trigger::OnStep => TriggerSet::ON_STEP,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerSet(u8);

impl TriggerSet {
    pub const ON_LIFT: u8 = 1;
    pub const ON_TEXT: u8 = 2;
    pub const ON_TIME: u8 = 4;
    pub const ON_STEP: u8 = 8;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, trigger: Trigger) -> bool {
        self.0 & trigger.bit() != 0
    }

    pub fn with(self, trigger: Trigger) -> Self {
        Self(self.0 | trigger.bit())
    }
}

impl FromIterator<Trigger> for TriggerSet {
    fn from_iter<I: IntoIterator<Item = Trigger>>(iter: I) -> Self {
        iter.into_iter().fold(TriggerSet::default(), TriggerSet::with)
    }
}

/// (触发集合, 阈值)；阈值对 on_time 是秒，对 on_step 是步数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GatePolicy {
    triggers: TriggerSet,
    threshold: f64,
}

impl GatePolicy {
    pub fn new(triggers: TriggerSet, threshold: f64) -> Result<Self, EnvError> {
        if triggers.contains(Trigger::OnTime) && triggers.contains(Trigger::OnStep) {
            return Err(EnvError::Config(
                "gate policy cannot combine on_time and on_step".to_string(),
            ));
        }
        Ok(Self { triggers, threshold })
    }

    pub fn triggers(&self) -> TriggerSet {
        self.triggers
    }

    /// 纯函数：`since_last` / `steps_since` 为 None 表示从未检查过
    pub fn should_check(
        &self,
        is_lift: bool,
        is_text: bool,
        since_last: Option<Duration>,
        steps_since: Option<u32>,
    ) -> bool {
        if self.triggers.contains(Trigger::OnLift) && is_lift {
            return true;
        }
        if self.triggers.contains(Trigger::OnText) && is_text {
            return true;
        }
        if self.triggers.contains(Trigger::OnTime) {
            return since_last.map_or(true, |d| d.as_secs_f64() >= self.threshold);
        }
        if self.triggers.contains(Trigger::OnStep) {
            return steps_since.map_or(true, |n| f64::from(n) >= self.threshold);
        }
        false
    }
}

/// 每类传感器一个：记录上次检查的时间与之后经过的步数
#[derive(Clone, Debug)]
pub struct GateTracker {
    policy: GatePolicy,
    last_check: Option<Instant>,
    steps_since: Option<u32>,
}

impl GateTracker {
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy,
            last_check: None,
            steps_since: None,
        }
    }

    /// 每步调用一次；返回 true 时视为本步已检查
    pub fn evaluate(&mut self, is_lift: bool, is_text: bool, now: Instant) -> bool {
        let steps = self.steps_since.map(|n| n.saturating_add(1));
        let since = self.last_check.map(|t| now.saturating_duration_since(t));
        let fire = self.policy.should_check(is_lift, is_text, since, steps);
        if fire {
            self.last_check = Some(now);
            self.steps_since = Some(0);
        } else {
            self.steps_since = steps;
        }
        fire
    }

    /// 新回合重新计时
    pub fn reset(&mut self) {
        self.last_check = None;
        self.steps_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(triggers: &[Trigger], threshold: f64) -> GatePolicy {
        GatePolicy::new(triggers.iter().copied().collect(), threshold).unwrap()
    }

    #[test]
    fn test_on_step_threshold_four() {
        let gate = policy(&[Trigger::OnStep], 4.0);
        assert!(gate.should_check(false, false, None, None));
        for n in 1..=3 {
            assert!(!gate.should_check(false, false, None, Some(n)), "steps {n}");
        }
        for n in 4..=8 {
            assert!(gate.should_check(false, false, None, Some(n)), "steps {n}");
        }
    }

    #[test]
    fn test_on_time_threshold() {
        let gate = policy(&[Trigger::OnTime], 2.0);
        assert!(gate.should_check(false, false, None, None));
        assert!(!gate.should_check(false, false, Some(Duration::from_millis(1500)), Some(10)));
        assert!(gate.should_check(false, false, Some(Duration::from_secs(2)), Some(0)));
    }

    #[test]
    fn test_lift_and_text_independent_of_elapsed() {
        let gate = policy(&[Trigger::OnLift, Trigger::OnStep], 100.0);
        assert!(gate.should_check(true, false, None, Some(1)));
        assert!(!gate.should_check(false, true, None, Some(1)));

        let text = policy(&[Trigger::OnText], 0.0);
        assert!(text.should_check(false, true, None, None));
        assert!(!text.should_check(true, false, None, None));
    }

    #[test]
    fn test_time_and_step_rejected() {
        let set: TriggerSet = [Trigger::OnTime, Trigger::OnStep].into_iter().collect();
        assert!(GatePolicy::new(set, 1.0).is_err());
        assert_eq!(TriggerSet::from_bits(TriggerSet::ON_LIFT | TriggerSet::ON_STEP).bits(), 9);
    }

    #[test]
    fn test_tracker_fires_every_n_steps() {
        let mut tracker = GateTracker::new(policy(&[Trigger::OnStep], 3.0));
        let now = Instant::now();
        let fired: Vec<bool> = (0..7).map(|_| tracker.evaluate(false, false, now)).collect();
        assert_eq!(fired, vec![true, false, false, true, false, false, true]);
        tracker.reset();
        assert!(tracker.evaluate(false, false, now));
    }
}
