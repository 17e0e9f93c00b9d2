use std::sync::Arc;

use log::info;

use lrs::Server;
use shared::config::DefaultMediaConfig;
use shared::hooks::Blackhole;

#[tokio::main]
async fn main() -> shared::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Config loading and the admin surface live outside the core; the
    // built-in defaults carry the standard ports.
    let config = Arc::new(DefaultMediaConfig);
    let hooks = Arc::new(Blackhole::default());

    let server = Server::new(config, hooks);
    let interrupt = server.interrupt();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            interrupt.stop();
        }
    });

    server.serve().await
}
