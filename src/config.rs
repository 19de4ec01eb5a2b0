//! Configuration loaded from environment variables at startup.
//!
//! Centralizes all PTYGATE_* env var access into a single Config struct,
//! providing a single source of truth with fail-fast validation.

use std::path::PathBuf;
use std::sync::Mutex;

/// Global configuration instance, lazily initialized and resettable for tests.
static CONFIG: Mutex<Option<Config>> = Mutex::new(None);

/// Configuration loaded from PTYGATE_* environment variables.
///
/// All environment variable access should go through this struct
/// rather than calling env::var directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// ptygate directory (PTYGATE_DIR or ~/.ptygate)
    pub ptygate_dir: PathBuf,
    /// Root of the agent's own data directory, where the session index
    /// lives (PTYGATE_AGENT_DIR or ~/.claude)
    pub agent_dir: PathBuf,
    /// Auto-approve the read-only tool allowlist (PTYGATE_AUTO_READONLY=1)
    pub auto_approve_readonly: bool,
    /// Verbose logging flag (PTYGATE_DEBUG=1)
    pub debug: bool,
}

impl Config {
    /// Initialize global config from environment variables (call once at startup).
    /// Can be called multiple times - subsequent calls are no-ops.
    pub fn init() {
        let mut config = CONFIG.lock().unwrap();
        if config.is_none() {
            *config = Some(Self::from_env());
        }
    }

    /// Get reference to global config (must call init() first).
    /// Panics if init() was not called.
    pub fn get() -> Config {
        CONFIG
            .lock()
            .unwrap()
            .clone()
            .expect("Config::init() must be called before Config::get()")
    }

    /// Get global config if initialized. Used by logging, which must
    /// never panic — an uninitialized config just means no log sink yet.
    pub fn try_get() -> Option<Config> {
        CONFIG.lock().unwrap().clone()
    }

    /// Reset global config (test-only).
    /// Allows tests to reinitialize config with different env vars.
    #[cfg(test)]
    pub fn reset() {
        *CONFIG.lock().unwrap() = None;
    }

    /// Load configuration from environment variables
    fn from_env() -> Self {
        use std::env;

        // PTYGATE_DIR: custom directory or ~/.ptygate
        let ptygate_dir = if let Ok(dir) = env::var("PTYGATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".ptygate")
        } else {
            PathBuf::from(".ptygate")
        };

        // PTYGATE_AGENT_DIR: where the agent keeps its per-project session
        // index. Defaults to ~/.claude (the external tooling's layout).
        let agent_dir = if let Ok(dir) = env::var("PTYGATE_AGENT_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".claude")
        } else {
            PathBuf::from(".claude")
        };

        // PTYGATE_AUTO_READONLY: boolean flag (true if "1")
        let auto_approve_readonly = env::var("PTYGATE_AUTO_READONLY")
            .map(|v| v == "1")
            .unwrap_or(false);

        // PTYGATE_DEBUG: boolean flag (true if "1")
        let debug = env::var("PTYGATE_DEBUG").map(|v| v == "1").unwrap_or(false);

        Self {
            ptygate_dir,
            agent_dir,
            auto_approve_readonly,
            debug,
        }
    }
}
