pub mod command_runner;
pub mod config;
pub mod event_bus;
pub mod guard;
pub mod store;

pub use command_runner::{
    classify, CommandOutcome, CommandOutput, CommandPolicy, CommandRunner, Classification,
    PolicyEntry, SafetyMode, Severity,
};
pub use config::{ConfigStore, LogVerbosity, SafetyModeSetting, WeaverSettings};
pub use event_bus::EventBus;
pub use guard::{Guard, WriteOutcome};
pub use store::{SharedStore, Store};
