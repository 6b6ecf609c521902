use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::watch;
use tracing::{error, info};

use tg_recipe_relay::config;
use tg_recipe_relay::consumer::QueueConsumer;
use tg_recipe_relay::content::ContentClient;
use tg_recipe_relay::db::{self, Directory};
use tg_recipe_relay::fanout::FanOut;
use tg_recipe_relay::handlers::{self, BackendAuth, TokenVerifier};
use tg_recipe_relay::notifier::TelegramNotifier;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only relay notifications; do not answer chat commands
    #[arg(long)]
    no_commands: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database.url).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let directory = Arc::new(Directory::new(pool.clone()));
    let content = Arc::new(ContentClient::from_config(&cfg)?);
    let notifier = Arc::new(TelegramNotifier::new(
        bot.clone(),
        cfg.telegram.send_timeout(),
    ));
    let fanout = FanOut::new(
        directory.clone(),
        directory,
        content,
        notifier,
        cfg.telegram.max_concurrent_sends,
    );

    if cfg.telegram.commands && !args.no_commands {
        let verifier: Arc<dyn TokenVerifier> = Arc::new(BackendAuth::new(
            &cfg.content.base_url,
            cfg.content.timeout(),
        )?);
        let pool = pool.clone();
        let bot = bot.clone();
        tokio::spawn(async move {
            info!("serving chat commands");
            teloxide::repl(bot, move |bot: Bot, msg: Message| {
                let pool = pool.clone();
                let verifier = verifier.clone();
                async move {
                    if let Err(err) =
                        handlers::handle_update(&bot, &pool, verifier.as_ref(), &msg).await
                    {
                        error!(?err, "failed to handle update");
                    }
                    respond(())
                }
            })
            .await;
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop signal received");
            let _ = stop_tx.send(true);
        }
    });

    info!(queue = %cfg.broker.queue, "starting relay");
    let consumer = QueueConsumer::from_config(&cfg, fanout);
    if let Err(err) = consumer.run(stop_rx).await {
        error!(%err, "relay cannot continue without the broker");
        std::process::exit(1);
    }
    info!("relay stopped");
    Ok(())
}
