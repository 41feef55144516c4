use std::net::SocketAddr;
use std::path::PathBuf;

use huddle_shared::constants::{DEFAULT_HTTP_PORT, MAX_UPLOAD_SIZE};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    /// Single allowed cross-origin for browser clients. `None` falls back to
    /// a permissive CORS policy (development mode).
    pub client_origin: Option<String>,
    pub upload_dir: PathBuf,
    pub max_upload_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            client_origin: None,
            upload_dir: PathBuf::from("./uploads"),
            max_upload_size: MAX_UPLOAD_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.http_addr = ([0, 0, 0, 0], parsed).into();
            } else {
                tracing::warn!(value = %port, "Invalid PORT, using default");
            }
        }

        if let Ok(origin) = std::env::var("CLIENT_ORIGIN") {
            if !origin.is_empty() {
                config.client_origin = Some(origin);
            }
        }

        if let Ok(dir) = std::env::var("UPLOAD_DIR") {
            if !dir.is_empty() {
                config.upload_dir = PathBuf::from(dir);
            }
        }

        config
    }
}
