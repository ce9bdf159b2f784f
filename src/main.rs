pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod llm;
pub mod logging;
pub mod rag;
pub mod util;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let pool = credential::pool::KeyPool::new(
        cfg.gemini_api_keys.clone(),
        cfg.quota_window(),
        Arc::new(credential::quota::SystemClock),
    )
    .context("初始化 Gemini API Key 池失败（请设置 GEMINI_API_KEY_1 或 GEMINI_API_KEYS）")?;
    tracing::info!(
        keys = pool.len(),
        limit = cfg.quota_limit,
        window_secs = cfg.quota_window_secs,
        "已加载 {} 个 Gemini API Key",
        pool.len()
    );

    let gemini = gemini::client::GeminiClient::new(&cfg).context("初始化 GeminiClient 失败")?;
    let invoker = llm::invoker::Invoker::new(gemini, Arc::new(pool))
        .with_timeout(Duration::from_millis(cfg.timeout_ms));
    let web = rag::web::DuckDuckGo::new(&cfg).context("初始化网页检索客户端失败")?;

    let rag = rag::service::QueryService::new(
        invoker,
        web,
        rag::service::RagSettings::from_config(&cfg),
    );

    // 启动时尽力加载/构建索引：失败不阻塞启动，之后可通过 /build-index 重试。
    if let Err(e) = rag
        .build_index(rag::service::BuildOptions {
            chunk_size: cfg.chunk_size,
            chunk_overlap: cfg.chunk_overlap,
            rebuild: false,
        })
        .await
    {
        tracing::warn!("启动时初始化 RAG 索引失败: {e}");
    }

    let state = Arc::new(gateway::AppState {
        rag,
        log_level: cfg.log_level(),
    });
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // 显式 DEBUG=off 关闭全部日志；否则依赖库默认 warn，本项目至少 info，
    // 避免环境中预设的 RUST_LOG=warn 把本项目的日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,vanilla_rag=info")
        } else if env.contains("vanilla_rag") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},vanilla_rag=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
