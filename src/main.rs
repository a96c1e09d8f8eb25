use snoozy::bot::{group_by_token, BotManager, DiscordSession};
use snoozy::config::Config;
use snoozy::db::Database;
use snoozy::guild_config::DISCORD_TOKEN;
use snoozy::messenger::BotDirectory;
use snoozy::supervisor::TaskSupervisor;
use snoozy::tasks::{periodic_tasks, TaskContext};
use snoozy::{shutdown, Data};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);
    info!("Hello from snoozy!");

    let db = Database::new(&config.database_url)?;
    db.execute_init()?;
    let data = Arc::new(Data::new(config, db)?);

    let tokens = group_by_token(data.guild_config.get_all(&DISCORD_TOKEN)?);
    if tokens.is_empty() {
        anyhow::bail!("no guild has {} configured", DISCORD_TOKEN.name);
    }
    info!("Starting {} bot sessions", tokens.len());
    let manager = Arc::new(BotManager::new(
        tokens
            .into_iter()
            .map(|(token, guilds)| (DiscordSession::new(token, guilds.clone(), data.clone()), guilds))
            .collect(),
    ));

    let supervisor = TaskSupervisor::new(periodic_tasks());
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let bots: Arc<dyn BotDirectory> = manager.clone();
    supervisor.start(
        async move {
            // Dropped sender means startup failed: never run.
            if ready_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        TaskContext::new(data.clone(), bots),
    );

    if let Err(e) = manager.start().await {
        supervisor.stop(STOP_TIMEOUT).await;
        manager.stop(STOP_TIMEOUT).await;
        return Err(e);
    }
    let _ = ready_tx.send(());

    shutdown::signal().await;
    info!("Interrupt received, stopping all processes");
    data.shutdown.trigger();
    supervisor.stop(STOP_TIMEOUT).await;
    manager.stop(STOP_TIMEOUT).await;
    info!("Goodbye");
    Ok(())
}
