//! Hutch Inspect - one-shot broker checks and publishing
//!
//! ```text
//! hutch-inspect queue task_queue
//! hutch-inspect exchange task_exchange
//! hutch-inspect publish --queue orders "hello"
//! hutch-inspect publish --exchange events --routing-key user.created '{"id":1}'
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hutch_bins::common::{init_logging, redact_url, CommonArgs};
use hutch_core::prelude::*;
use hutch_core::transport::amqp::LapinTransport;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect queues and exchanges, publish messages")]
struct InspectArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show message and consumer counts of a queue
    Queue { name: String },

    /// Check whether an exchange exists
    Exchange { name: String },

    /// Publish a persistent message with bounded retries
    Publish {
        #[arg(long)]
        queue: Option<String>,

        #[arg(long)]
        exchange: Option<String>,

        /// Routing key for --exchange (defaults to the configured key)
        #[arg(long)]
        routing_key: Option<String>,

        /// Attempt budget (defaults to the configured max retries)
        #[arg(long)]
        retries: Option<u32>,

        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = InspectArgs::parse();
    let config = args.common.load_config()?;
    init_logging(&config)?;

    info!("Broker: {}", redact_url(&config.broker.url));
    let session = SessionManager::from_config(&config, Arc::new(LapinTransport::new()));

    let result = run(args.command, &session, &config).await;
    session.close().await;
    result
}

async fn run(command: Command, session: &SessionManager, config: &HutchConfig) -> Result<()> {
    match command {
        Command::Queue { name } => {
            let info = Checker::new(session.clone()).queue_info(&name).await?;
            println!(
                "queue '{}': {} messages, {} consumers",
                name, info.message_count, info.consumer_count
            );
        }
        Command::Exchange { name } => {
            let exists = Checker::new(session.clone()).exchange_exists(&name).await?;
            if !exists {
                bail!("exchange '{}' does not exist", name);
            }
            println!("exchange '{}' exists", name);
        }
        Command::Publish {
            queue,
            exchange,
            routing_key,
            retries,
            message,
        } => {
            let routing_key = routing_key.unwrap_or_else(|| config.broker.routing_key.clone());
            let route = exchange.as_deref().map(|ex| (ex, routing_key.as_str()));
            let Some(target) = Target::resolve(queue.as_deref(), route) else {
                bail!("publish needs --queue, --exchange or both");
            };

            let publisher = RetryingPublisher::from_config(session.clone(), config);
            let mut options = PublishOptions::default();
            if let Some(retries) = retries {
                options = options.max_retries(retries);
            }

            publisher
                .publish_with(&target, message.as_bytes(), options)
                .await?;
            println!("published {} bytes to {}", message.len(), target);
        }
    }
    Ok(())
}
