pub const SERVICE_NAME: &str = "vpsdeck";

pub const BACKEND_ENV: &str = "VPSDECK_BACKEND"; // Runtime override
pub const CONFIG_OVERRIDE_ENV: &str = "VPSDECK_CONFIG_DIR";
pub const TOKEN_ENV: &str = "VPSDECK_TOKEN";

pub const DEFAULT_BACKEND: &str = "http://localhost:8000";

pub const HTTP_TIMEOUT_SECS: u64 = 30;

pub const RETRY_DELAY_MS: u64 = 500;
pub const MAX_NETWORK_RETRIES: u32 = 3;

// Log refetch cadence by session status.
pub const PROVISIONING_REFETCH_MS: u64 = 4_000;
pub const READY_REFETCH_MS: u64 = 15_000;
pub const DEFAULT_REFETCH_MS: u64 = 8_000;

/// Session list heartbeat when every listed session is terminal.
pub const IDLE_LIST_REFRESH_SECS: u64 = 30;

pub const LAUNCH_WAIT_TIMEOUT_SECS: u64 = 600;

pub const USER_AGENT: &str = "vpsdeck/0.3";

pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns backend URL dynamically at runtime.
///
/// Integration tests point the binary at a scripted server through the env var.
pub fn backend_url() -> String {
    std::env::var(BACKEND_ENV)
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| DEFAULT_BACKEND.to_string())
}
