pub mod config;
pub mod error;
pub mod route;
pub mod target;
pub mod validate;

pub use config::Settings;
pub use error::DevhostError;
pub use route::RouteRecord;
pub use target::{Target, Upstream};
