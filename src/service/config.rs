extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::client::RetryPolicy;
use crate::message::TopicMeta;

pub const ENV_PREFIX: &str = "LANEMQ";

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub max_package_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 10000,
            max_connection: 1024,
            max_package_size: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestHandlerPool {
    pub channel_capacity: usize,
    /// 0 means one worker per cpu
    pub num_channels: usize,
    /// seconds between two worker health checks
    pub monitor_interval: u64,
    pub worker_check_timeout: u64,
}

impl Default for RequestHandlerPool {
    fn default() -> Self {
        RequestHandlerPool {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval: 10,
            worker_check_timeout: 10,
        }
    }
}

impl RequestHandlerPool {
    pub fn worker_count(&self) -> usize {
        if self.num_channels == 0 {
            num_cpus::get()
        } else {
            self.num_channels
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub otlp_enabled: bool,
    pub log_dir: String,
    /// used when `RUST_LOG` is not set
    pub default_directive: String,
    /// also print metrics to stdout, for local debugging
    pub stdout_metrics: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            otlp_enabled: false,
            log_dir: "logs".to_string(),
            default_directive: "info".to_string(),
            stdout_metrics: false,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub request_handler_pool: RequestHandlerPool,
    pub tracing: TracingConfig,
    /// topics created when the node starts
    pub topics: Vec<TopicMeta>,
}

impl NodeConfig {
    /// Loads the config file, then applies `LANEMQ__<SECTION>__<KEY>`
    /// environment overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path_to_str(path.as_ref())?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let node_config: NodeConfig = config.try_deserialize()?;
        for topic in &node_config.topics {
            topic.validate()?;
        }
        Ok(node_config)
    }
}

/// Client side settings shared by the publisher and subscriber tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// capacity of the merged subscription channel
    pub subscription_buffer: usize,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            retry: RetryPolicy::default(),
            subscription_buffer: 1024,
            max_frame_size: NetworkConfig::default().max_package_size,
        }
    }
}

impl ClientConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ClientConfig> {
        let path_str = path_to_str(path.as_ref())?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

fn path_to_str(path: &Path) -> AppResult<&str> {
    path.to_str().ok_or(AppError::InvalidValue(format!(
        "config file path: {}",
        path.to_string_lossy()
    )))
}
