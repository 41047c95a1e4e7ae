//! 传感器 worker：日志、UI 状态、视觉、UI 树四类后台检查循环
//!
//! 每类 worker 持有一部分事件源，通过 [`WorkerHandle`] 的收件箱 / 发件箱与编排器交互，
//! 只调用事件源的 `set`，快照由编排器统一进行。

pub mod log;
pub mod screen_state;
pub mod ui_tree;
pub mod vision;
pub mod worker;

pub use log::start_log_watcher;
pub use screen_state::{AppScreenChecker, ScreenCheck, ScreenStateSensor};
pub use ui_tree::UiTreeSensor;
pub use vision::{BBox, NullRecognizer, Recognizer, VisionSensor};
pub use worker::{spawn_sensor, CheckPayload, Sensor, SensorStatus, WorkerHandle};
