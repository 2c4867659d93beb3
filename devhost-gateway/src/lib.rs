pub mod client;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod ws;

pub use client::UpstreamClient;
pub use metrics::GatewayMetrics;
pub use server::{Gateway, GatewayState};
