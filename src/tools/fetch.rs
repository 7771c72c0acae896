//! Fetch 工具：域名白名单、结果大小限制
//!
//! 仅允许配置中的域名（如 docs.rs、github.com）；GET 请求带 User-Agent，整体超时由 ToolInvoker 控制；
//! 响应超过 max_result_chars 时截断并追加 ...[truncated]。HTML 响应经 html2text 转为可读文本。

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::tools::Tool;

const USER_AGENT: &str = concat!("crew/", env!("CARGO_PKG_VERSION"));

/// Fetch 工具：抓取 URL 内容，仅允许白名单域名
pub struct FetchTool {
    client: Client,
    allowed_domains: BTreeSet<String>,
    max_result_chars: usize,
}

/// 判断内容是否像 HTML
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head = s.get(..s.len().min(512)).unwrap_or(s).to_lowercase();
    head.starts_with("<!") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

/// 提取 host（去掉端口与路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

impl FetchTool {
    pub fn new(allowed_domains: Vec<String>, max_result_chars: usize) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .collect();
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains,
            max_result_chars,
        }
    }

    /// 为底层 HTTP 客户端设置请求超时（与 ToolInvoker 的超时取先到者）
    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        if let Ok(client) = Client::builder().user_agent(USER_AGENT).timeout(timeout).build() {
            self.client = client;
        }
        self
    }

    /// 域名精确匹配，或为白名单域名的子域
    fn check(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        let allowed = self
            .allowed_domains
            .iter()
            .any(|d| domain == *d || domain.ends_with(&format!(".{d}")));
        if allowed {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {}", domain))
        }
    }

    fn truncate(&self, body: String) -> String {
        if body.chars().count() > self.max_result_chars {
            body.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]"
        } else {
            body
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        self.check(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}');

        let text = if looks_like_html(body) {
            html2text::from_read(body.as_bytes(), 120).unwrap_or_else(|_| body.to_string())
        } else {
            body.to_string()
        };
        Ok(self.truncate(text))
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch URL content as readable text (domain allowlist applies). Args: {\"url\": \"https://...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "http(s) URL on an allowed domain" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if url.is_empty() {
            return Err("Missing url".to_string());
        }
        tracing::info!(url = %url, "fetch tool execute");
        self.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://docs.rs/tokio"), Some("docs.rs".into()));
        assert_eq!(extract_domain("http://Example.com:8080/x?y"), Some("example.com".into()));
        assert_eq!(extract_domain("ftp://example.com"), None);
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_allowlist_and_subdomains() {
        let tool = FetchTool::new(vec!["github.com".into()], 100);
        assert!(tool.check("https://github.com/rust-lang").is_ok());
        assert!(tool.check("https://api.github.com/repos").is_ok());
        assert!(tool.check("https://evilgithub.com").is_err());
    }

    #[test]
    fn test_truncate() {
        let tool = FetchTool::new(vec![], 5);
        assert_eq!(tool.truncate("abcdefgh".into()), "abcde\n...[truncated]");
        assert_eq!(tool.truncate("abc".into()), "abc");
    }

    #[tokio::test]
    async fn test_disallowed_domain_fails_without_request() {
        let tool = FetchTool::new(vec!["docs.rs".into()], 100);
        let err = tool
            .execute(serde_json::json!({"url": "https://example.org"}))
            .await
            .unwrap_err();
        assert!(err.contains("not in allowlist"));
    }
}
