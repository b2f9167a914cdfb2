use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::{CONFIG_OVERRIDE_ENV, SERVICE_NAME, TOKEN_ENV};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub saved_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into().trim().to_string(),
            saved_at: Utc::now(),
        }
    }
}

pub async fn cfg_dir() -> Result<PathBuf> {
    if let Ok(override_dir) = std::env::var(CONFIG_OVERRIDE_ENV) {
        let mut p = PathBuf::from(override_dir);
        p.push(SERVICE_NAME);
        tokio::fs::create_dir_all(&p)
            .await
            .context("create override config dir")?;
        return Ok(p);
    }

    let mut p = dirs::config_dir().context("could not determine config directory")?;
    p.push(SERVICE_NAME);
    tokio::fs::create_dir_all(&p)
        .await
        .context("create config dir")?;
    Ok(p)
}

pub async fn credentials_file() -> Result<PathBuf> {
    Ok(cfg_dir().await?.join("credentials.json"))
}

pub async fn write_credentials(credentials: &Credentials) -> Result<()> {
    let path = credentials_file().await?;
    let data = serde_json::to_vec_pretty(credentials)?;

    tokio::fs::write(&path, &data)
        .await
        .context("write credentials file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await
        {
            warn!("Failed to set strict permissions on credentials file: {}", e);
        }
    }

    Ok(())
}

pub async fn read_credentials() -> Result<Credentials> {
    let path = credentials_file().await?;
    let bytes = tokio::fs::read(&path).await.context("read credentials file")?;
    let credentials: Credentials =
        serde_json::from_slice(&bytes).context("parse credentials json")?;
    Ok(credentials)
}

pub async fn remove_credentials() -> Result<()> {
    let path = credentials_file().await?;
    match tokio::fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("remove credentials file"),
    }
}

/// Bearer token for API calls: the environment wins over the saved file.
pub async fn resolve_token() -> Option<String> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }
    match read_credentials().await {
        Ok(credentials) if !credentials.token.is_empty() => Some(credentials.token),
        Ok(_) => None,
        Err(e) => {
            debug!("no saved credentials: {:#}", e);
            None
        }
    }
}
