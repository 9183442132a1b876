use chrono::Local;
use clap::Parser;
use lanemq::{
    hash_to_partition, setup_local_tracing, AppResult, BrokerClient, ClientConfig,
};
use tokio_stream::StreamExt;
use tracing::info;

/// Prints the messages published to a topic from now on.
#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    #[arg(long, default_value = "127.0.0.1:10000")]
    pub server_addr: String,
    #[arg(long, default_value = "topic")]
    pub topic: String,
    #[arg(long, default_value = "subscriber")]
    pub consumer_group: String,
    /// exit after this many messages
    #[arg(long, default_value_t = 1000)]
    pub n: usize,
    /// client config file (retry policy, buffer sizes)
    #[arg(short, long)]
    pub conf: Option<String>,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    setup_local_tracing("info")?;
    let commandline = CommandLine::parse();
    let config = match &commandline.conf {
        Some(path) => ClientConfig::set_up_config(path)?,
        None => ClientConfig::default(),
    };

    let client =
        BrokerClient::single_node(&commandline.server_addr, &commandline.consumer_group, config);
    let meta = client.topic(&commandline.topic).await?;
    let subscription = client.subscribe(&commandline.topic).await?;
    info!(topic = %meta.topic, partitions = meta.partitions, client = %client.client_id(), "subscribed");

    let mut messages = subscription.take(commandline.n);
    while let Some(message) = messages.next().await {
        // the key decides the partition, so it can be recovered here
        let partition = hash_to_partition(message.key(), meta.partitions)?;
        println!(
            "{} partition={} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            partition,
            message
        );
    }
    Ok(())
}
