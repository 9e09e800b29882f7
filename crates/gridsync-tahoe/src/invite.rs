//! Grid settings export and exchange
//!
//! The settings document carries everything a peer needs to provision a
//! client on the same grid. Delivery is left to an [`InviteTransport`],
//! which only has to move one JSON value in each direction.

use crate::error::Result;
use crate::gateway::{write_private_file, ClientOptions, Gateway};
use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Connection settings of a gateway's grid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub client: ClientOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootcap: Option<String>,
}

/// Rendezvous channel between two peers
#[async_trait]
pub trait InviteTransport: Send + Sync {
    async fn send(&self, message: Value) -> Result<()>;

    async fn receive(&self) -> Result<Value>;
}

/// Accepts `"3"`, `3` or null for share counts
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

impl Gateway {
    pub fn get_settings(&mut self) -> Settings {
        let client = ClientOptions {
            nickname: self.config_get("node", "nickname"),
            introducer: self.config_get("client", "introducer.furl"),
            shares_needed: self.config_get("client", "shares.needed"),
            shares_happy: self.config_get("client", "shares.happy"),
            shares_total: self.config_get("client", "shares.total"),
        };
        let icon_url = fs::read_to_string(self.paths.icon_url())
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Settings {
            client,
            icon_url,
            rootcap: self.get_rootcap().map(|cap| cap.into_string()),
        }
    }

    /// Write the settings document to `dest` as JSON
    pub fn export(&mut self, dest: &Path) -> Result<()> {
        let settings = self.get_settings();
        fs::write(dest, serde_json::to_string_pretty(&settings)?)?;
        info!("Exported settings to {}", dest.display());
        Ok(())
    }

    pub async fn send_settings(&mut self, transport: &dyn InviteTransport) -> Result<()> {
        let settings = self.get_settings();
        transport.send(serde_json::to_value(&settings)?).await?;
        debug!("Sent settings");
        Ok(())
    }

    /// Receive settings from a peer and provision this gateway's node with them
    pub async fn create_client_from_invite(&self, transport: &dyn InviteTransport) -> Result<Settings> {
        let settings: Settings = serde_json::from_value(transport.receive().await?)?;
        debug!(nickname = ?settings.client.nickname, "Received settings");
        self.create_client(&settings.client).await?;
        if let Some(icon_url) = &settings.icon_url {
            fs::write(self.paths.icon_url(), icon_url)?;
        }
        if let Some(rootcap) = &settings.rootcap {
            write_private_file(&self.paths.rootcap(), rootcap)?;
        }
        Ok(settings)
    }
}
