pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use error::{AnemoneError, AnemoneResult};
pub use registry::{ConfigRegistry, PeerDirectory, ShareRegistry, UserDirectory};
pub use types::{HashAlgorithm, Peer, Share, ShareType, UserRecord};
