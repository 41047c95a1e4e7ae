//! 任务层：任务定义文件与 setup / reset 步骤解释

pub mod definition;
pub mod setup;

pub use definition::{SetupStep, TaskDefinition};
pub use setup::{ScriptedSetup, TaskSetup};
