//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool / WriteFileTool 基于 SafeFs 提供读、列目录、写入能力。
//! 产物写入（ArtifactWriter）同样经由 SafeFs，保证任务输出不会落到工作区之外。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::CrewError;
use crate::tools::Tool;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn root_canon(&self) -> PathBuf {
        self.root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone())
    }

    /// 解析已存在的路径，要求其位于沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, CrewError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| CrewError::Io(format!("Path not found: {}", path)))?;
        if canonical.starts_with(self.root_canon()) {
            Ok(canonical)
        } else {
            Err(CrewError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    /// 解析待写入的路径（文件可以尚不存在）：拒绝绝对路径与任何 `..` 分量
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, CrewError> {
        let trimmed = path.trim().trim_start_matches("./");
        if trimmed.is_empty() {
            return Err(CrewError::Io("Empty path".to_string()));
        }
        let rel = Path::new(trimmed);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(CrewError::PathEscape(trimmed.to_string()));
        }
        Ok(self.root_canon().join(rel))
    }

    pub fn read_file(&self, path: &str) -> Result<String, CrewError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved)
            .map_err(|e| CrewError::Io(format!("Read failed: {}", e)))
    }

    /// 写入文件（覆盖），自动创建父目录，返回写入的绝对路径
    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, CrewError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CrewError::Io(format!("Create dir failed: {}", e)))?;
        }
        std::fs::write(&target, content)
            .map_err(|e| CrewError::Io(format!("Write failed: {}", e)))?;
        Ok(target)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, CrewError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| CrewError::Io(format!("List failed: {}", e)))? {
            let e = e.map_err(|e| CrewError::Io(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn path_arg<'a>(args: &'a Value, default: &'a str) -> &'a str {
    args.get("path").and_then(|v| v.as_str()).unwrap_or(default)
}

fn path_schema(extra: Option<(&str, &str)>) -> Value {
    let mut properties = serde_json::json!({
        "path": { "type": "string", "description": "Path relative to the workspace" }
    });
    let mut required = vec!["path".to_string()];
    if let Some((name, desc)) = extra {
        properties[name] = serde_json::json!({ "type": "string", "description": desc });
        required.push(name.to_string());
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn parameters_schema(&self) -> Value {
        path_schema(None)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, "");
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(path).map_err(|e| e.to_string())
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, ".");
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        Ok(entries.join("\n"))
    }
}

/// 写入文件（覆盖已有内容）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write (overwrite) a file. Args: {\"path\": \"file path relative to workspace\", \"content\": \"text\"}"
    }

    fn parameters_schema(&self) -> Value {
        path_schema(Some(("content", "Full file content to write")))
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, "");
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing content".to_string())?;
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        self.fs
            .write_file(path, content)
            .map_err(|e| e.to_string())?;
        Ok(format!("Wrote {} bytes to {}", content.len(), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(matches!(
            fs.resolve_for_write("../outside.txt"),
            Err(CrewError::PathEscape(_))
        ));
        assert!(matches!(
            fs.resolve_for_write("/etc/passwd"),
            Err(CrewError::PathEscape(_))
        ));
        assert!(fs.resolve_for_write("reports/a.md").is_ok());
    }

    #[tokio::test]
    async fn test_write_then_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        let read = ReadFileTool::new(dir.path());
        let list = ListDirTool::new(dir.path());

        write
            .execute(json!({"path": "notes/todo.md", "content": "ship it"}))
            .await
            .unwrap();
        let text = read.execute(json!({"path": "notes/todo.md"})).await.unwrap();
        assert_eq!(text, "ship it");

        let root = list.execute(json!({})).await.unwrap();
        assert_eq!(root, "notes/");
    }

    #[tokio::test]
    async fn test_read_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(dir.path());
        let err = read.execute(json!({"path": "nope.txt"})).await.unwrap_err();
        assert!(err.contains("Path not found"));
    }
}
