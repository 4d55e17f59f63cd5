//! 日志初始化：支持 RUST_LOG 覆盖、默认级别与输出格式选择。

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// 初始化 tracing 日志订阅与默认过滤规则。
pub fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (full, compact) = match format {
        LogFormat::Full => (Some(fmt::layer().with_target(false)), None),
        LogFormat::Compact => (None, Some(fmt::layer().compact().with_target(false))),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(full)
        .with(compact)
        .init();
}
