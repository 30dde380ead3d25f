//! Configuration loaded from a TOML file with CLI overrides

mod schema;
mod store;

pub use schema::*;
pub use store::{load_config, resolve_config_path, CONFIG_ENV, DEFAULT_CONFIG_FILE};
