use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use backup_core::ServerConfig;
use minecraft_client_rs::Client;
use tokio::fs;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

mod chat;
mod checkpoint;

pub use chat::{broadcast, translate_color_codes};
pub use checkpoint::RconCheckpointer;

const DEFAULT_RCON_PORT: u16 = 25575;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconSettings {
    pub address: String,
    pub password: String,
}

/// One-shot RCON connection per command: connect, authenticate, send, close.
#[derive(Clone)]
pub struct RconClient {
    settings: RconSettings,
    io_timeout: Duration,
}

impl RconClient {
    pub fn new(address: String, password: String) -> Self {
        Self::from_settings(RconSettings { address, password })
    }

    pub fn from_settings(settings: RconSettings) -> Self {
        Self { settings, io_timeout: DEFAULT_IO_TIMEOUT }
    }

    /// Bound on a whole command round trip, connect included.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.settings.address
    }

    /// Run `command` on the server and return its reply body. Gives up after
    /// the client's IO timeout; the abandoned connection is left to fail on
    /// its own on the blocking pool.
    pub async fn execute(&self, command: &str) -> Result<String> {
        let settings = self.settings.clone();
        let line = command.to_string();
        let exchange = spawn_blocking(move || round_trip(settings, line));

        match timeout(self.io_timeout, exchange).await {
            Ok(joined) => joined.context("RCON task failed")?,
            Err(_) => Err(anyhow!(
                "RCON command '{command}' to {} timed out after {}s",
                self.settings.address,
                self.io_timeout.as_secs_f32()
            )),
        }
    }
}

fn round_trip(settings: RconSettings, command: String) -> Result<String> {
    let mut client = Client::new(settings.address).map_err(text)?;
    client.authenticate(settings.password).map_err(text)?;
    let reply = client.send_command(command).map_err(text)?;
    client.close().map_err(text)?;
    Ok(reply.body)
}

// the client's errors are not Send + Sync, so keep only their text
fn text<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow!(err.to_string())
}

/// Explicit address/password wins; otherwise read `server.properties` from
/// `server_dir`.
pub async fn resolve_settings(server: &ServerConfig) -> Result<RconSettings> {
    if let (Some(address), Some(password)) = (&server.rcon_address, &server.rcon_password) {
        return Ok(RconSettings { address: address.clone(), password: password.clone() });
    }
    let dir = server
        .server_dir
        .as_deref()
        .context("no RCON address and no server_dir configured")?;
    load_rcon_settings(dir)
        .await?
        .with_context(|| format!("RCON is not enabled in {}", dir.join("server.properties").display()))
}

pub async fn load_rcon_settings(server_dir: &Path) -> Result<Option<RconSettings>> {
    let properties_path = server_dir.join("server.properties");
    let content = match fs::read_to_string(&properties_path).await {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    parse_rcon_properties(&content)
}

/// Reads the RCON keys out of a `server.properties` body. `None` when RCON is
/// not enabled.
fn parse_rcon_properties(content: &str) -> Result<Option<RconSettings>> {
    let properties = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()));

    let (mut enabled, mut port, mut password) = (false, None, None);
    for (key, value) in properties {
        match key {
            "enable-rcon" => enabled = value.eq_ignore_ascii_case("true"),
            "rcon.port" => port = value.parse::<u16>().ok(),
            "rcon.password" if !value.is_empty() => password = Some(value.to_string()),
            _ => {}
        }
    }

    if !enabled {
        return Ok(None);
    }
    let password = password.context("rcon is enabled but rcon.password is empty")?;
    Ok(Some(RconSettings {
        address: format!("127.0.0.1:{}", port.unwrap_or(DEFAULT_RCON_PORT)),
        password,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("atlas-backup-rcon-{prefix}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn server(address: Option<&str>, password: Option<&str>, dir: Option<PathBuf>) -> ServerConfig {
        ServerConfig {
            rcon_address: address.map(str::to_string),
            rcon_password: password.map(str::to_string),
            server_dir: dir,
            hold_saves: true,
            broadcast: true,
        }
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        // accepts the connection (via the backlog) but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("local addr").to_string();
        let client = RconClient::new(address, "pw".to_string())
            .with_io_timeout(std::time::Duration::from_millis(200));

        let err = client.execute("save-all").await.expect_err("no reply");
        assert!(err.to_string().contains("timed out"), "{err:#}");
        // closing the listener resets the stuck connection so its thread exits
        drop(listener);
    }

    #[test]
    fn properties_with_rcon_enabled_yield_settings() {
        let settings = parse_rcon_properties(
            "#Minecraft server properties\nenable-rcon=true\nrcon.port=25599\nrcon.password=hunter2\nmotd=hi=there\n",
        )
        .expect("parse")
        .expect("rcon enabled");
        assert_eq!(settings.address, "127.0.0.1:25599");
        assert_eq!(settings.password, "hunter2");
    }

    #[test]
    fn disabled_rcon_yields_none_and_missing_password_errors() {
        assert!(parse_rcon_properties("enable-rcon=false\nrcon.password=x\n")
            .expect("parse")
            .is_none());
        assert!(parse_rcon_properties("enable-rcon=true\n").is_err());
    }

    #[test]
    fn default_port_is_used_when_unset() {
        let settings = parse_rcon_properties("enable-rcon=TRUE\nrcon.password=pw\n")
            .expect("parse")
            .expect("enabled");
        assert_eq!(settings.address, "127.0.0.1:25575");
    }

    #[tokio::test]
    async fn explicit_address_wins_over_server_dir() {
        let settings = resolve_settings(&server(
            Some("10.0.0.2:25575"),
            Some("pw"),
            Some(PathBuf::from("/nonexistent")),
        ))
        .await
        .expect("resolve");
        assert_eq!(settings.address, "10.0.0.2:25575");
    }

    #[tokio::test]
    async fn server_dir_is_read_for_settings() {
        let dir = unique_temp_dir("properties");
        tokio::fs::write(
            dir.join("server.properties"),
            "enable-rcon=true\nrcon.password=secret\n",
        )
        .await
        .expect("write properties");

        let settings = resolve_settings(&server(None, None, Some(dir.clone())))
            .await
            .expect("resolve");
        assert_eq!(settings.password, "secret");

        let err = resolve_settings(&server(None, None, Some(dir.join("missing"))))
            .await
            .expect_err("no properties");
        assert!(err.to_string().contains("not enabled"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
