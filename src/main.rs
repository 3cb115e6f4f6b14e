use std::sync::Arc;

use q2q_server::{config::Config, server_main};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    let overlay = server_main(config).await?;

    tokio::signal::ctrl_c().await?;
    overlay.stop().await;
    Ok(())
}
