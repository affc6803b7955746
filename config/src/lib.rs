pub mod config;
pub mod defaults;
pub mod queue;
pub mod settings;

pub use config::{
    DEFAULT_CONFIG_FILENAME, ENV_CONFIG_KEY, load_settings_or_default, load_toml_settings,
    resolve_config_source, validate_settings,
};
pub use defaults::*;
pub use queue::{MEMBER_SEPARATOR, validate_name};
pub use settings::{CoordSettings, LockSettings};
