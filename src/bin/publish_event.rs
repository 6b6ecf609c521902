use anyhow::{bail, Result};
use clap::Parser;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use std::path::PathBuf;
use tracing::info;

use tg_recipe_relay::config;
use tg_recipe_relay::model::ContentPublishedEvent;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Publish a new-recipe event (or the shutdown sentinel) to the relay queue"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long, required_unless_present = "shutdown")]
    creator_id: Option<i64>,

    #[arg(long, required_unless_present = "shutdown")]
    content_id: Option<i64>,

    /// Send the sentinel that stops the relay instead of an event
    #[arg(long, conflicts_with_all = ["creator_id", "content_id"])]
    shutdown: bool,
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
    let queue = cfg.broker.queue.as_str();

    let payload = if args.shutdown {
        queue.as_bytes().to_vec()
    } else {
        let (Some(creator_id), Some(content_id)) = (args.creator_id, args.content_id) else {
            bail!("--creator-id and --content-id are required");
        };
        serde_json::to_vec(&ContentPublishedEvent {
            creator_id,
            content_id,
        })?
    };

    let conn = Connection::connect(&cfg.broker.url, ConnectionProperties::default()).await?;
    let channel = conn.create_channel().await?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: cfg.broker.durable,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &payload,
            BasicProperties::default()
                .with_content_type("application/json".to_string().into())
                .with_delivery_mode(2),
        )
        .await?
        .await?;
    info!(queue, bytes = payload.len(), shutdown = args.shutdown, "published");

    conn.close(200, "done").await?;
    Ok(())
}
