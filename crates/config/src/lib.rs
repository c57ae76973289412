//! Gateway configuration: schema, discovery and loading.
//!
//! Config files may be TOML, YAML or JSON. `${VAR}` placeholders are
//! replaced from the environment before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, find_config_file, load_config,
        set_config_dir,
    },
    schema::{GatewayConfig, RoutingConfig, ServerConfig, StateBackend, StateConfig},
};
