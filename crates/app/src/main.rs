use std::net::SocketAddr;

use app::activity::{STALENESS_WINDOW, SWEEP_INTERVAL};
use app::build_state;
use app::config::AppConfig;
use app::routes::build_router;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_LOG_FILTER: &str = "info,app=info,sandbox=info";

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = AppConfig::from_env()?;
    let addr = config.addr();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(async move {
        let state = build_state(&config);
        let _reaper = state.activity.spawn_reaper(SWEEP_INTERVAL, STALENESS_WINDOW);
        let app = build_router(state, config.max_body_bytes);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, image = %config.sandbox_image, "listening");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
