//! rcm - Caddyfile → rathole 同步工具
//!
//! Usage:
//! - Preview: `rcm sync --dry-run`
//! - Preview then deploy: `rcm sync --dry-run --commit`
//! - Deploy: `rcm sync`
//! - Status of both machines: `rcm status`

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rcm::cli::Cli;
use rcm::services::ssh::{SessionPool, SshConnector};

/// 收到信号后的退出码
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志写 stderr，stdout 只输出命令结果
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rcm=info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let pool = Arc::new(SessionPool::new(Arc::new(SshConnector::default()), cli.probe));
    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = tokio::select! {
        result = cli.run(pool.clone()) => Some(result),
        _ = shutdown.cancelled() => None,
    };

    signals.abort();
    pool.close_all().await;

    match result {
        Some(result) => result,
        None => {
            tracing::warn!("Interrupted, SSH sessions closed");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// 等待 ctrl-c / SIGTERM 后触发 shutdown
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
