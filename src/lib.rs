//! Crew - Rust 多智能体编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、运行监管、过程事件
//! - **llm**: 补全服务客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **observability**: tracing 初始化
//! - **runtime**: 由配置装配补全客户端、工具与产物目录
//! - **tools**: 工具 trait、注册表、带超时与审计的调用器、内置工具
//! - **worker**: Worker 推理循环、步骤解析、提示词、委派接口
//! - **workflow**: 任务图、上下文、执行引擎（顺序 / 层级）、构建器、产物与报告

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod runtime;
pub mod tools;
pub mod worker;
pub mod workflow;

pub use crate::core::{CrewError, RunEvent, RunSupervisor};
pub use crate::workflow::{Crew, CrewBuilder, CrewSpec, ExecutionEngine, RunReport, TaskGraph};
