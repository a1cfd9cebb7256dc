//! Load session - configuration and the host-side orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::events::{LoadObserver, TracingObserver};
use crate::host::{BridgeControl, FastLoadOptions, HttpBridge, fast_load, terminal};
use crate::protocol::LoadType;
use crate::protocol::constants::*;
use crate::protocol::loader::LoaderBundle;
use crate::transport::{PacketTransport, TcpTransport};

/// Configuration for a load session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Baud rate of the ROM-protocol load of the second-stage loader.
    pub initial_baud_rate: u32,
    /// Baud rate of the packet protocol.
    pub final_baud_rate: u32,
    /// Bridge GPIO wired to the target's RESn.
    pub reset_pin: u8,
    /// Target clock in Hz.
    pub clock_speed: u32,
    pub telnet_port: u16,
    pub http_port: u16,
    /// Serial rate used by terminal mode.
    pub terminal_baud_rate: u32,
    /// Loader bundle manifest.
    pub loader_bundle: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_baud_rate: DEFAULT_INITIAL_BAUD_RATE,
            final_baud_rate: DEFAULT_FINAL_BAUD_RATE,
            reset_pin: DEFAULT_RESET_PIN,
            clock_speed: DEFAULT_CLOCK_SPEED,
            telnet_port: DEFAULT_TELNET_PORT,
            http_port: DEFAULT_HTTP_PORT,
            terminal_baud_rate: DEFAULT_TERMINAL_BAUD_RATE,
            loader_bundle: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn fast_load_options(&self) -> FastLoadOptions {
        FastLoadOptions {
            clock_speed: self.clock_speed,
            initial_baud_rate: self.initial_baud_rate,
            final_baud_rate: self.final_baud_rate,
            reset_pin: self.reset_pin,
            telnet_port: self.telnet_port,
            http_port: self.http_port,
        }
    }

    fn bridge(&self, host: &str) -> HttpBridge {
        HttpBridge::new(host, self.http_port, self.reset_pin, self.initial_baud_rate)
    }
}

/// Load session - runs operations against one bridge.
pub struct LoadSession<O: LoadObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    host: String,
}

impl LoadSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(host: impl Into<String>, config: SessionConfig) -> Self {
        Self::with_observer(host, config, Arc::new(TracingObserver))
    }
}

impl<O: LoadObserver> LoadSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(host: impl Into<String>, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            host: host.into(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn load_bundle(&self) -> Result<LoaderBundle> {
        let path = self
            .config
            .loader_bundle
            .as_ref()
            .ok_or_else(|| anyhow!("No loader bundle configured"))?;
        info!(path = %path.display(), "Loading loader bundle");
        LoaderBundle::load_from_file(path)
            .with_context(|| format!("Failed to load loader bundle {}", path.display()))
    }

    /// Fast-load `program` onto the target.
    #[instrument(skip(self, program), fields(host = %self.host))]
    pub fn load(&self, program: &Path, load_type: LoadType) -> Result<()> {
        let bundle = self.load_bundle()?;
        let options = self.config.fast_load_options();
        fast_load(
            &self.host,
            program,
            load_type,
            &bundle,
            &options,
            self.observer.as_ref(),
        )
        .with_context(|| format!("Failed to load {}", program.display()))
    }

    /// Pulse the target's reset line.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn reset(&self) -> Result<()> {
        self.config
            .bridge(&self.host)
            .reset()
            .context("Reset request failed")
    }

    /// Change the bridge's serial rate.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        if baud_rate == 0 {
            return Err(anyhow!("Baud rate must be non-zero"));
        }
        self.config
            .bridge(&self.host)
            .set_baud_rate(baud_rate)
            .context("Set baud rate request failed")
    }

    /// Switch the bridge to the terminal rate and relay stdin/stdout over
    /// its serial port until ESC is typed or the bridge hangs up.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn terminal(&self) -> Result<()> {
        self.set_baud_rate(self.config.terminal_baud_rate)?;
        let transport = TcpTransport::connect(&self.host, self.config.telnet_port)
            .context("Failed to connect to the bridge serial port")?;
        info!(baud_rate = self.config.terminal_baud_rate, "Terminal mode, ESC to exit");
        let result = terminal::relay(&transport, std::io::stdin(), std::io::stdout());
        transport.close().ok();
        result.context("Terminal session failed")
    }
}
