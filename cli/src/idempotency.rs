use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::warn;

/// Source of idempotency keys for mutations.
///
/// One key is drawn per logical user action; retries of that action reuse it.
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self) -> String;
}

/// UUID v4 keys from the OS RNG, with a timestamped pseudo-random fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn next_key(&self) -> String {
        let mut bytes = [0u8; 16];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => uuid::Builder::from_random_bytes(bytes)
                .into_uuid()
                .to_string(),
            Err(err) => {
                warn!("OS random source unavailable, using fallback idempotency key: {}", err);
                fallback_key()
            }
        }
    }
}

fn fallback_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}
