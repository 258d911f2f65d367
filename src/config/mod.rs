//! Configuration System
//!
//! Configuration management for the server and client binaries using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `PTD_DIRECTOR_`
//! 2. TOML configuration file given on the command line
//!
//! # Example
//!
//! ```no_run
//! use ptd_director::config::ServerSettings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ServerSettings::load_from("config/server.toml")?;
//!     println!("Listening on {}", settings.server.listen);
//!     println!("PTDaemon port {}", settings.ptd.network_port);
//!     Ok(())
//! }
//! ```

pub mod settings;

pub use settings::{
    is_valid_label, ApplicationConfig, ClientConfig, ClientSettings, ConfigError,
    KeepaliveSettings, PtdConfig, ServerConfig, ServerSettings, DEFAULT_PORT, ENV_PREFIX,
};
