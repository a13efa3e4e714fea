//! Library crate for camscan: zero-configuration IP camera discovery.
pub mod error;
pub mod netdetect;
pub mod onvif;
pub mod patterns;
pub mod ports;
pub mod scanner;
pub mod server;
pub mod session;
pub mod types;

pub use error::{DiscoveryError, Result};
pub use scanner::NetworkScanner;
pub use session::{DiscoveryEvent, DiscoveryService};
