pub mod action;
pub mod entities;
pub mod error;

pub use action::{ActionBatch, ActionKind, ActionResult};
pub use entities::{
    Candidate, CandidateRecord, Event, Feature, FeatureStatus, ModelBindings, Priority, Project,
    ProjectStatus, Subtask, SubtaskStatus, ApplyType, UsageAggregate,
};
pub use error::{WeaverError, WeaverResult};
