pub use app_error::{AppError, AppResult};
pub use config::{ClientConfig, NodeConfig};
pub use node::Node;
pub use node_service::NodeService;
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, OtelGuard};

mod app_error;
mod config;
mod node;
mod node_service;
mod server;
mod shutdown;
mod tracing_config;
