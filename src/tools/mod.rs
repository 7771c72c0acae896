pub mod echo;
pub mod fetch;
pub mod filesystem;
pub mod invoker;
pub mod registry;
pub mod schema;
pub mod shell;

pub use echo::EchoTool;
pub use fetch::FetchTool;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use invoker::ToolInvoker;
pub use registry::{Tool, ToolRegistry};
pub use schema::{delegation_schema_json, tool_call_schema_json};
pub use shell::ShellTool;
