use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use vpsdeck_common::{Product, Session};

const LINUX_ACTION: i64 = 1;
const WINDOWS_ACTION: i64 = 2;
const DUMMY_ACTION: i64 = 3;

/// Operating-system flavor a worker action code provisions.
///
/// `Other` is a recognized numeric code without a dedicated label (the
/// backend's "dummy" action); `Unknown` means the code was absent or not a
/// number at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Linux,
    Windows,
    Other(i64),
    Unknown,
}

impl Variant {
    pub fn from_action_code(code: i64) -> Self {
        match code {
            LINUX_ACTION => Variant::Linux,
            WINDOWS_ACTION => Variant::Windows,
            other => Variant::Other(other),
        }
    }

    pub fn action_code(&self) -> Option<i64> {
        match self {
            Variant::Linux => Some(LINUX_ACTION),
            Variant::Windows => Some(WINDOWS_ACTION),
            Variant::Other(code) => Some(*code),
            Variant::Unknown => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Variant::Linux => "Linux",
            Variant::Windows => "Windows",
            Variant::Other(_) => "Dummy",
            Variant::Unknown => "Unknown",
        }
    }

    /// Value sent as `vmType` when launching.
    pub fn vm_type(&self) -> Option<&'static str> {
        match self {
            Variant::Linux => Some("linux"),
            Variant::Windows => Some("windows"),
            Variant::Other(_) => Some("dummy"),
            Variant::Unknown => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Linux => f.write_str("linux"),
            Variant::Windows => f.write_str("windows"),
            Variant::Other(DUMMY_ACTION) => f.write_str("dummy"),
            Variant::Other(code) => write!(f, "action {}", code),
            Variant::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown VM variant '{0}' (expected linux, windows, dummy or an action code)")]
pub struct ParseVariantError(String);

impl FromStr for Variant {
    type Err = ParseVariantError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "linux" => Ok(Variant::Linux),
            "windows" | "win" => Ok(Variant::Windows),
            "dummy" | "test" => Ok(Variant::Other(DUMMY_ACTION)),
            other => other
                .parse::<i64>()
                .map(Variant::from_action_code)
                .map_err(|_| ParseVariantError(raw.to_string())),
        }
    }
}

/// Accepts a JSON number or a numeric string.
pub fn parse_action_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn variant_of(value: Option<&Value>) -> Variant {
    value
        .and_then(parse_action_code)
        .map(Variant::from_action_code)
        .unwrap_or(Variant::Unknown)
}

/// Resolves a session's variant.
///
/// The first non-null code wins: the session's `worker_action`, then its
/// `provision_action`, then the originating product's `provision_action`.
pub fn resolve_variant(session: &Session) -> Variant {
    let code = present(session.worker_action.as_ref())
        .or_else(|| present(session.provision_action.as_ref()))
        .or_else(|| {
            session
                .product
                .as_ref()
                .and_then(|product| present(product.provision_action.as_ref()))
        });
    variant_of(code)
}

pub fn product_variant(product: &Product) -> Variant {
    variant_of(present(product.provision_action.as_ref()))
}

/// First active catalog entry provisioning `variant`.
pub fn product_for_variant(products: &[Product], variant: Variant) -> Option<&Product> {
    if variant == Variant::Unknown {
        return None;
    }
    products
        .iter()
        .find(|product| product.is_active() && product_variant(product) == variant)
}
