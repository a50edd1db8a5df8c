mod load;
mod types;

pub use load::{load_default, load_from_path};
pub use types::{
    AppConfig, BackendKind, BusConfig, LoggingConfig, StateConfig, StorageConfig,
};
