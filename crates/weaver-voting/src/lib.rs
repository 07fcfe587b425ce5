pub mod action_executor;
pub mod paraphraser;
pub mod red_flag;
pub mod voting;

pub use action_executor::ActionExecutor;
pub use paraphraser::Paraphraser;
pub use red_flag::{evaluate as evaluate_red_flags, RedFlagRule};
pub use voting::{VotingConfig, VotingEngine, VotingResult};
