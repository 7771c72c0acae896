//! 运行监管：取消令牌
//!
//! 持有 CancellationToken；取消在任务边界生效，进行中的补全与工具调用通过 select 立即中断。

use tokio_util::sync::CancellationToken;

/// 单次运行的生命周期管理
#[derive(Debug, Clone, Default)]
pub struct RunSupervisor {
    cancel_token: CancellationToken,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（Ctrl+C 或调用方主动取消）
    pub fn cancel(&self) {
        tracing::info!("run cancellation requested");
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个委派子任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}
