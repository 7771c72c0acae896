//! 任务产物落盘
//!
//! 校验通过后把输出写到任务声明的 output_file（相对 artifacts 根目录，经 SafeFs 防逃逸）。
//! 同一次运行中每个目标最多写一次，已写集合由 RunState 持有。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::core::CrewError;
use crate::tools::SafeFs;

#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    fs: SafeFs,
}

impl ArtifactWriter {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// 写入一个产物；destination 已在 written 中时返回 ContextConflict 且不触碰文件
    pub fn write_once(
        &self,
        written: &mut BTreeSet<String>,
        destination: &str,
        content: &str,
    ) -> Result<PathBuf, CrewError> {
        if written.contains(destination) {
            return Err(CrewError::ContextConflict(format!(
                "artifact '{destination}' was already written in this run"
            )));
        }
        let path = self.fs.write_file(destination, content)?;
        written.insert(destination.to_string());
        tracing::info!(path = %path.display(), bytes = content.len(), "artifact written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_once_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let mut written = BTreeSet::new();

        let path = writer
            .write_once(&mut written, "reports/review.md", "# Review")
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# Review");

        let err = writer
            .write_once(&mut written, "reports/review.md", "# Again")
            .unwrap_err();
        assert!(matches!(err, CrewError::ContextConflict(_)));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("reports/review.md")).unwrap(),
            "# Review"
        );
    }

    #[test]
    fn test_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let mut written = BTreeSet::new();
        assert!(matches!(
            writer.write_once(&mut written, "../evil.md", "x"),
            Err(CrewError::PathEscape(_))
        ));
        assert!(written.is_empty());
    }
}
