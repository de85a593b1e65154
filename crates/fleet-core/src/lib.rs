pub mod catalog;
pub mod condition;
pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod route;
pub mod run;
pub mod sequence;
pub mod traits;
pub mod types;

pub use catalog::CatalogFile;
pub use config::AppConfig;
pub use error::{FleetError, Result};
pub use event::{EventBus, FleetEvent};
pub use types::*;
