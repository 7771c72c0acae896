//! 运行时装配：由 AppConfig 构建补全客户端、工具注册表与调用器、产物写入器

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::tools::{
    EchoTool, FetchTool, ListDirTool, ReadFileTool, ShellTool, ToolInvoker, ToolRegistry, WriteFileTool,
};
use crate::workflow::ArtifactWriter;

/// provider 为 openai 且设置了 OPENAI_API_KEY 时用 OpenAI 兼容端点，否则退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key)))
        }
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        _ => {
            tracing::warn!(provider = %provider, "No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 评估用客户端：模型取 override、[evaluation] model、[llm] model 中第一个设置的，后端与凭据同 [llm]
pub fn create_eval_llm(cfg: &AppConfig, model_override: Option<&str>) -> Arc<dyn LlmClient> {
    let mut eval_cfg = cfg.clone();
    if let Some(model) = model_override
        .map(str::to_string)
        .or_else(|| cfg.evaluation.model.clone())
    {
        eval_cfg.llm.model = model;
    }
    tracing::debug!(model = %eval_cfg.llm.model, "evaluator client");
    create_llm_from_config(&eval_cfg)
}

/// 内置工具全部注册，文件类工具与 shell 绑定到 root
pub fn create_tool_registry(cfg: &AppConfig, root: &Path) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(ReadFileTool::new(root));
    registry.register(ListDirTool::new(root));
    registry.register(WriteFileTool::new(root));
    registry.register(ShellTool::new(cfg.tools.shell.allowed_commands.clone(), root));
    registry.register(
        FetchTool::new(
            cfg.tools.fetch.allowed_domains.clone(),
            cfg.tools.fetch.max_result_chars,
        )
        .with_request_timeout(Duration::from_secs(cfg.tools.fetch.timeout_secs.max(1))),
    );
    registry
}

/// 创建工具沙箱根目录（不存在时新建）并返回调用器
pub fn create_invoker(cfg: &AppConfig) -> std::io::Result<ToolInvoker> {
    let root = cfg.filesystem_root();
    std::fs::create_dir_all(&root)?;
    let root = root.canonicalize()?;
    tracing::debug!(root = %root.display(), "tool sandbox ready");
    Ok(ToolInvoker::new(create_tool_registry(cfg, &root), cfg.tool_timeout()))
}

pub fn create_artifact_writer(cfg: &AppConfig) -> std::io::Result<ArtifactWriter> {
    let root = cfg.artifacts_root();
    std::fs::create_dir_all(&root)?;
    Ok(ArtifactWriter::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_tool_registry(&AppConfig::default(), dir.path());
        assert_eq!(
            registry.tool_names(),
            vec!["echo", "fetch", "list_dir", "read_file", "shell", "write_file"]
        );
    }

    #[test]
    fn test_mock_provider_selected() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        let llm = create_llm_from_config(&cfg);
        assert_eq!(llm.token_usage(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_eval_llm_follows_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        cfg.evaluation.model = Some("judge".to_string());
        let llm = create_eval_llm(&cfg, Some("stricter-judge"));
        let reply = llm
            .complete(&[crate::llm::Message::user("Evaluation Task: check\n\nOutput to grade:\nx")])
            .await
            .unwrap();
        assert!(reply.contains("\"score\""));
    }

    #[test]
    fn test_invoker_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.tools.filesystem_root = Some(dir.path().join("sandbox"));
        let invoker = create_invoker(&cfg).unwrap();
        assert!(dir.path().join("sandbox").is_dir());
        assert!(invoker.tool_names().contains(&"write_file".to_string()));
    }
}
