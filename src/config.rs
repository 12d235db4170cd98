use std::path::PathBuf;
use std::{env, io};

use tracing::debug;

pub const DEFAULT_LOOKUP_ENDPOINT: &str = "https://vpic.nhtsa.dot.gov/api/vehicles/decodevinvalues";
const DEFAULT_THROTTLE_DELAY_MS: u64 = 100;
const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PLACEHOLDER: &str = "N/A";
const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub lookup_endpoint: String,
    pub throttle_delay_ms: u64,
    pub lookup_timeout_ms: u64,
    pub missing_value_placeholder: String,
    pub diagnostics_path: Option<PathBuf>,
    pub diagnostics_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            lookup_endpoint: env::var("VIN_LOOKUP_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOOKUP_ENDPOINT.to_string()),
            throttle_delay_ms: parse_u64("VIN_LOOKUP_THROTTLE_MS", DEFAULT_THROTTLE_DELAY_MS),
            lookup_timeout_ms: parse_u64("VIN_LOOKUP_TIMEOUT_MS", DEFAULT_LOOKUP_TIMEOUT_MS)
                .max(1),
            missing_value_placeholder: env::var("VIN_LOOKUP_PLACEHOLDER")
                .unwrap_or_else(|_| DEFAULT_PLACEHOLDER.to_string()),
            diagnostics_path: env::var("VIN_DIAGNOSTICS_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            diagnostics_capacity: parse_usize(
                "VIN_DIAGNOSTICS_CAPACITY",
                DEFAULT_DIAGNOSTICS_CAPACITY,
            )
            .max(1),
        }
    }

    pub fn with_throttle_delay_ms(mut self, delay_ms: u64) -> Self {
        self.throttle_delay_ms = delay_ms;
        self
    }

    pub fn with_lookup_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.lookup_endpoint = endpoint.into();
        self
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
