pub mod client;
pub mod decode;

pub use client::{PanelClient, PanelCredentials};
