#![cfg_attr(feature = "strict", deny(warnings))]

mod batch;
mod buffer;
mod config;
mod constructor;
mod disk_space;
mod error;
mod progress;
mod resume;
mod workers;

pub mod testing;

pub use config::ConstructorConfig;
pub use constructor::{ConstructionSummary, FileConstructor};
pub use error::{AbortFlag, ConstructionError, Result};
pub use progress::{ConstructorObserver, ControlHandle, NullObserver, ProgressCounters};
