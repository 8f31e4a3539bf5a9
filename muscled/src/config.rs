use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 2960;

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Limits {
    /// Byte cap on each session's outgoing queue.
    pub max_bytes_per_session: usize,
    /// Ceiling on tree nodes one session may create.
    pub max_nodes_per_session: usize,
    /// Largest accepted incoming message body.
    pub max_message_size: u32,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_bytes_per_session: 4 * 1024 * 1024,
            max_nodes_per_session: 1 << 20,
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Privileges {
    /// Hostmasks allowed to kick other sessions.
    pub kick: Vec<String>,
    /// Hostmasks refused at accept time.
    pub ban: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: Option<String>,
    pub log_level: String,
    pub limits: Limits,
    pub privileges: Privileges,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: DEFAULT_PORT,
            bind_address: None,
            log_level: "info".to_owned(),
            limits: Limits::default(),
            privileges: Privileges::default(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    /// The socket address to listen on.
    pub fn listen_address(&self) -> String {
        let host = self.bind_address.as_deref().unwrap_or("0.0.0.0");

        format!("{}:{}", host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.listen_address(), "0.0.0.0:2960");
        assert_eq!(config.limits.max_message_size, 4 * 1024 * 1024);
        assert!(config.privileges.kick.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig = serdeconv::from_toml_str(
            r#"
port = 3333
[privileges]
kick = ["10.0.0.*"]
"#,
        )
        .unwrap();

        assert_eq!(config.port, 3333);
        assert_eq!(config.limits.max_nodes_per_session, 1 << 20);
        assert_eq!(config.privileges.kick, vec!["10.0.0.*".to_owned()]);
    }
}
