use tokio_util::sync::CancellationToken;

use outboxsync_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outboxsync_observability::init();

    let settings = Settings::from_env()?;

    let shutdown = CancellationToken::new();
    let signals = outboxsync_daemon::signal::listen(shutdown.clone())?;

    let result = outboxsync_daemon::app::run(settings, shutdown.clone()).await;
    shutdown.cancel();
    let _ = signals.await;
    result
}
