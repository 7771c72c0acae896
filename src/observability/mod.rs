//! 可观测性：tracing 订阅者初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，RUST_LOG 覆盖；verbose 时本 crate 提升到 debug。日志写 stderr，stdout 留给最终输出
pub fn init(verbose: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if verbose {
        if let Ok(directive) = "crew=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
