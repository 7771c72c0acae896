pub mod artifacts;
pub mod builder;
pub mod context;
pub mod engine;
pub mod evaluation;
pub mod graph;
pub mod hierarchical;
pub mod report;
pub mod training;
pub mod types;
pub mod validation;

pub use artifacts::ArtifactWriter;
pub use builder::{interpolate, Crew, CrewBuilder, CrewSpec};
pub use context::{ContextEntry, ContextStore};
pub use engine::{EngineSettings, ExecutionEngine, RunState};
pub use evaluation::{evaluate_runs, EvaluationReport, Evaluator, IterationResult, TaskScore};
pub use graph::TaskGraph;
pub use hierarchical::{DelegationLimits, Dispatcher};
pub use report::{RunFailure, RunReport, TaskRecord, EXIT_CONFIG, EXIT_EXECUTION, EXIT_SUCCESS};
pub use training::{train, ConsoleFeedback, FeedbackSource, TaskFeedback, TrainingData, TrainingIteration};
pub use types::*;
pub use validation::validate_output;
