use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use lanemq::{setup_local_tracing, setup_tracing, AppResult, Node, NodeConfig};
use tokio::runtime;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut node_config = NodeConfig::set_up_config(config_path)?;
    match commandline.verbose {
        0 => {}
        1 => node_config.tracing.default_directive = "info".to_string(),
        2 => node_config.tracing.default_directive = "debug".to_string(),
        _ => node_config.tracing.default_directive = "trace".to_string(),
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", node_config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let _otel_guard = if node_config.tracing.otlp_enabled {
        let _entered = rt.enter();
        Some(setup_tracing(&node_config.tracing)?)
    } else {
        setup_local_tracing(&node_config.tracing.default_directive)?;
        None
    };

    let mut node = Node::new(node_config);
    node.start(&rt)?;

    Ok(())
}
