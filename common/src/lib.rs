pub mod types;
pub mod protocol;
pub mod error;
pub mod serde_helpers;

pub use types::*;
pub use protocol::*;
pub use error::*;
