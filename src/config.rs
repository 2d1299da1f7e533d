//! Runtime configuration: bind addresses and the persistence directory,
//! each overridable by an environment variable. There is no CLI
//! surface; three constants don't need one.

use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_TCP_ADDR: &str = "0.0.0.0:2470";
const DEFAULT_UDP_ADDR: &str = "0.0.0.0:514";

#[derive(Debug, Clone)]
pub struct Config {
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub state_dir: PathBuf,
}

impl Config {
    /// Reads `LW_TCP_ADDR`, `LW_UDP_ADDR`, `LW_STATE_DIR` from the
    /// environment, falling back to defaults for whichever are unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let tcp_addr = parse_env_addr("LW_TCP_ADDR", DEFAULT_TCP_ADDR)?;
        let udp_addr = parse_env_addr("LW_UDP_ADDR", DEFAULT_UDP_ADDR)?;
        let state_dir = std::env::var("LW_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default());
        Ok(Config { tcp_addr, udp_addr, state_dir })
    }
}

fn parse_env_addr(var: &str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::InvalidAddr { var: var.to_string(), value: raw })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid socket address: {value}")]
    InvalidAddr { var: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_cleanly() {
        assert!(DEFAULT_TCP_ADDR.parse::<SocketAddr>().is_ok());
        assert!(DEFAULT_UDP_ADDR.parse::<SocketAddr>().is_ok());
    }

    #[test]
    fn rejects_garbage_env_addr() {
        assert!(matches!(
            parse_env_addr("LW_TEST_DOES_NOT_EXIST_ADDR", "not an address"),
            Err(ConfigError::InvalidAddr { .. })
        ));
    }
}
