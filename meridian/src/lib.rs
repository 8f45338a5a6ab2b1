mod config;
mod routing_node;
mod shard_registry;

pub use config::Config;
pub use routing_node::{RoutingNode, SessionCheckout};
pub use shard_registry::ShardRegistry;
