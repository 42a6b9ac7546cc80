use anyhow::Result;
use serenity::{
    async_trait,
    model::{gateway::GatewayIntents, gateway::Ready},
    prelude::{Context, EventHandler},
    Client,
};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

use guildtunes::{Config, Orchestrator};

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("✅ Connected as {} ({} guilds)", ready.user.name, ready.guilds.len());
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guildtunes=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting GuildTunes v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();
    let http = reqwest::Client::builder()
        .user_agent(concat!("guildtunes/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let orchestrator = Arc::new(Orchestrator::from_config(&config, songbird.clone(), http));

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler)
        .register_songbird_with(songbird)
        .await?;

    {
        let mut data = client.data.write().await;
        data.insert::<Orchestrator>(orchestrator.clone());
    }

    orchestrator.start();

    let shard_manager = client.shard_manager.clone();
    let shutdown = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Could not listen for Ctrl+C: {}", e);
            return;
        }
        info!("⚠️ Shutdown signal received");
        shutdown.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
