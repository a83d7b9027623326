//! Well-known ports and directories.  Unix hosts (macOS included) use the
//! XDG layout under `$HOME` rather than the platform default.

use std::path::PathBuf;

pub const BRIDGE_TCP_PORT: u16 = 9877;

const APP_DIR: &str = "scrobbler";

/// `~/.local/share/scrobbler`: log, pid file, connector options.
pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    let base = home_dir().join(".local").join("share");
    #[cfg(not(unix))]
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// `~/.config/scrobbler`: `config.toml` and the optional `connectors.toml`.
pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    let base = home_dir().join(".config");
    #[cfg(not(unix))]
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

#[cfg(unix)]
fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir)
}
