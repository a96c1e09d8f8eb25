//! One gateway session per bot token, shared by every guild configured with that token.

use crate::guild_config::ConfigValue;
use crate::messenger::{BotDirectory, Messenger};
use crate::{events, Data, Error};
use async_trait::async_trait;
use serenity::all::{ClientBuilder, Context, FullEvent, GatewayIntents, GuildId, Http};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

/// A connection to the platform that serves some set of guilds.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Connects and runs until `stop` flips. Sends on `ready` once commands can be served.
    async fn run(self: Arc<Self>, ready: oneshot::Sender<()>, stop: watch::Receiver<bool>) -> anyhow::Result<()>;

    /// Outbound actions, available once connected.
    fn messenger(&self) -> Option<Arc<dyn Messenger>>;
}

/// Inverts guild -> token into token -> guilds. Guilds with an unreadable token are skipped.
pub fn group_by_token(tokens: HashMap<GuildId, ConfigValue<String>>) -> BTreeMap<String, Vec<GuildId>> {
    let mut grouped: BTreeMap<String, Vec<GuildId>> = BTreeMap::new();
    for (guild, token) in tokens {
        match token.value() {
            Ok(token) => grouped.entry(token).or_default().push(guild),
            Err(e) => error!(guild_id = %guild, "{}", e),
        }
    }
    for guilds in grouped.values_mut() {
        guilds.sort();
    }
    grouped
}

pub struct BotManager<S> {
    sessions: Vec<Arc<S>>,
    guild_bots: HashMap<GuildId, Arc<S>>,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Session> BotManager<S> {
    pub fn new(sessions: Vec<(S, Vec<GuildId>)>) -> Self {
        let mut guild_bots = HashMap::new();
        let sessions = sessions
            .into_iter()
            .map(|(session, guilds)| {
                let session = Arc::new(session);
                for guild in guilds {
                    guild_bots.insert(guild, session.clone());
                }
                session
            })
            .collect();
        let (stop_tx, _) = watch::channel(false);
        Self {
            sessions,
            guild_bots,
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Opens every session concurrently. Returns once all of them are ready, or with an error
    /// as soon as one exits before getting there.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut readies = JoinSet::new();
        {
            let mut handles = self.handles.lock().unwrap();
            for (index, session) in self.sessions.iter().enumerate() {
                let (ready_tx, ready_rx) = oneshot::channel();
                let stop_rx = self.stop_tx.subscribe();
                let session = session.clone();
                handles.push(tokio::spawn(
                    async move {
                        if let Err(e) = session.run(ready_tx, stop_rx).await {
                            error!("Bot session failed: {:#}", e);
                        }
                    }
                    .instrument(info_span!("session", session = index)),
                ));
                readies.spawn(ready_rx);
            }
        }

        while let Some(ready) = readies.join_next().await {
            if !matches!(ready, Ok(Ok(()))) {
                anyhow::bail!("a bot session exited before it was ready");
            }
        }
        info!("All {} bot sessions are ready", self.sessions.len());
        Ok(())
    }

    /// Closes every session and waits for them to exit, up to `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        self.stop_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            error!("Bot sessions did not stop within {:?}", timeout);
        }
    }

    pub fn guild_bot(&self, guild: GuildId) -> Option<Arc<S>> {
        self.guild_bots.get(&guild).cloned()
    }
}

impl<S: Session> BotDirectory for BotManager<S> {
    fn messenger(&self, guild: GuildId) -> Option<Arc<dyn Messenger>> {
        self.guild_bot(guild).and_then(|session| session.messenger())
    }
}

pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_PRESENCES
}

/// A serenity client driven by a poise framework that only forwards events.
pub struct DiscordSession {
    token: String,
    guilds: Vec<GuildId>,
    data: Arc<Data>,
    http: OnceLock<Arc<Http>>,
}

impl DiscordSession {
    pub fn new(token: String, guilds: Vec<GuildId>, data: Arc<Data>) -> Self {
        Self {
            token,
            guilds,
            data,
            http: OnceLock::new(),
        }
    }
}

async fn event_handler(
    ctx: &Context,
    event: &FullEvent,
    _framework: poise::FrameworkContext<'_, Arc<Data>, Error>,
    data: &Arc<Data>,
) -> Result<(), Error> {
    events::dispatch(ctx, event, data);
    Ok(())
}

async fn register_commands(ctx: &Context, data: &Data, guilds: &[GuildId]) {
    let commands = data.commands.to_platform(&data.i18n);
    info!("Registering {} application commands", commands.len());
    for guild in guilds {
        if let Err(e) = guild.set_commands(ctx, commands.clone()).await {
            error!(guild_id = %guild, "Failed to register application commands: {}", e);
        }
    }
}

#[async_trait]
impl Session for DiscordSession {
    async fn run(self: Arc<Self>, ready: oneshot::Sender<()>, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        let data = self.data.clone();
        let guilds = self.guilds.clone();
        let framework = poise::Framework::builder()
            .options(poise::FrameworkOptions {
                event_handler: |ctx, event, framework, data| Box::pin(event_handler(ctx, event, framework, data)),
                ..Default::default()
            })
            .setup(move |ctx, ready_event, _framework| {
                Box::pin(async move {
                    info!(bot = %ready_event.user.name, "Bot started");
                    register_commands(ctx, &data, &guilds).await;
                    info!("Bot is now ready to accept commands");
                    if ready.send(()).is_err() {
                        warn!("Nobody is waiting for this session to become ready");
                    }
                    Ok(data)
                })
            })
            .build();

        let mut client = ClientBuilder::new(&self.token, intents())
            .framework(framework)
            .await?;
        let _ = self.http.set(client.http.clone());
        let shard_manager = client.shard_manager.clone();

        tokio::select! {
            result = client.start() => result?,
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                info!("Received stop signal, stopping bot");
                shard_manager.shutdown_all().await;
            }
        }
        Ok(())
    }

    fn messenger(&self) -> Option<Arc<dyn Messenger>> {
        self.http.get().map(|http| http.clone() as Arc<dyn Messenger>)
    }
}
