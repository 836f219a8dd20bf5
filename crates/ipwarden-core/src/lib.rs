pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use clock::unix_now;
pub use config::{DisableMethod, WardenConfig};
pub use constants::*;
pub use error::WardenError;
pub use types::*;
