use std::time::Duration;

use clap::Parser;
use lanemq::{setup_local_tracing, AppError, AppResult, BrokerClient, ClientConfig, Message};
use tracing::info;

/// Publishes `key-<i>`/`value-<i>` messages to a topic in batches.
#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    #[arg(long, default_value = "127.0.0.1:10000")]
    pub server_addr: String,
    #[arg(long, default_value = "topic")]
    pub topic: String,
    /// total number of messages
    #[arg(long, default_value_t = 1000)]
    pub n: usize,
    #[arg(long, default_value_t = 10)]
    pub messages_per_request: usize,
    /// pause between two requests
    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,
    /// create the topic with this many partitions before publishing
    #[arg(long)]
    pub partitions: Option<i32>,
    /// client config file (retry policy, buffer sizes)
    #[arg(short, long)]
    pub conf: Option<String>,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    setup_local_tracing("info")?;
    let commandline = CommandLine::parse();
    if commandline.messages_per_request == 0 {
        return Err(AppError::InvalidValue(
            "messages-per-request must be positive".into(),
        ));
    }
    let config = match &commandline.conf {
        Some(path) => ClientConfig::set_up_config(path)?,
        None => ClientConfig::default(),
    };

    let client = BrokerClient::single_node(&commandline.server_addr, "publisher", config);
    if let Some(partitions) = commandline.partitions {
        match client.create_topic(&commandline.topic, partitions, 1).await {
            Ok(()) | Err(AppError::TopicAlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
    }

    let mut sent = 0;
    while sent < commandline.n {
        let batch_end = (sent + commandline.messages_per_request).min(commandline.n);
        let batch = (sent..batch_end)
            .map(|i| Message::new(format!("key-{}", i), format!("value-{}", i)))
            .collect();
        client.publish(&commandline.topic, batch).await?;
        sent = batch_end;
        info!(topic = %commandline.topic, sent, "published batch");
        if commandline.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(commandline.interval_ms)).await;
        }
    }
    info!(topic = %commandline.topic, total = sent, "done");
    Ok(())
}
