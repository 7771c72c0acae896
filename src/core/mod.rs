//! 核心层：错误与恢复、运行监管、过程事件

pub mod error;
pub mod events;
pub mod recovery;
pub mod session_supervisor;

pub use error::{CrewError, FailureKind, RecoveryAction, ToolErrorKind, WorkerErrorKind};
pub use events::{send_event, RunEvent};
pub use recovery::{BackoffPolicy, RecoveryEngine};
pub use session_supervisor::RunSupervisor;
