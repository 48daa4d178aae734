pub mod config;
pub mod error;
pub mod link;
pub mod simulator;
pub mod transport;

pub use error::{LinkError, Result};
pub use link::{FrameLink, LinkConfig, LinkStats};
