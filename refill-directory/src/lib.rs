//! HTTP client to the remote fleet directory (spec §6).
//!
//! Authenticates with username/password, fetches the set of tags
//! permitted for a tank, and validates tags locally against that
//! cached set. The directory token is refreshed at 4.5 minutes
//! (tokens are valid ~5 minutes).

use async_trait::async_trait;
use refill_api::model::{Tag, VehicleRecord};
use refill_api::{Error, FleetDirectory, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const TOKEN_LIFETIME: Duration = Duration::from_secs(5 * 60);
const TOKEN_REFRESH_AT: Duration = Duration::from_millis((4.5 * 60.0 * 1000.0) as u64);

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct TagDto {
    tag: String,
    fleet_number: String,
    tank_capacity_liters: f64,
    current_machine_hours: u32,
}

#[derive(Serialize)]
struct UpdateHoursRequest<'a> {
    tag: &'a str,
    machine_hours: u32,
}

pub struct HttpFleetDirectory {
    client: reqwest::Client,
    cfg: DirectoryConfig,
    token: Option<String>,
    token_issued: Option<Instant>,
    tags: HashMap<String, VehicleRecord>,
}

impl HttpFleetDirectory {
    pub fn new(cfg: DirectoryConfig) -> Self {
        HttpFleetDirectory {
            client: reqwest::Client::new(),
            cfg,
            token: None,
            token_issued: None,
            tags: HashMap::new(),
        }
    }

    fn token_needs_refresh(&self) -> bool {
        match self.token_issued {
            None => true,
            Some(issued) => issued.elapsed() >= TOKEN_REFRESH_AT,
        }
    }

    async fn ensure_logged_in(&mut self) -> Result<()> {
        if self.token.is_none() || self.token_needs_refresh() {
            self.login().await
        } else {
            Ok(())
        }
    }

    fn bearer(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| Error::AuthenticationError)
    }
}

#[async_trait]
impl FleetDirectory for HttpFleetDirectory {
    async fn login(&mut self) -> Result<()> {
        let url = format!("{}/login", self.cfg.base_url);
        let body = LoginRequest {
            username: &self.cfg.username,
            password: &self.cfg.password,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::AuthenticationError.with_detail(e))?;

        if !resp.status().is_success() {
            return Err(Error::AuthenticationError);
        }

        let parsed: LoginResponse = resp
            .json()
            .await
            .map_err(|e| Error::ProtocolError(format!("bad login response: {}", e)))?;

        debug!("fleet directory login succeeded, token valid ~{:?}", TOKEN_LIFETIME);
        self.token = Some(parsed.token);
        self.token_issued = Some(Instant::now());
        Ok(())
    }

    async fn refresh_tags(&mut self, tank_id: u64) -> Result<()> {
        self.ensure_logged_in().await?;

        let url = format!("{}/tanks/{}/tags", self.cfg.base_url, tank_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(|e| Error::OperationError(format!("tag fetch failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::OperationError(format!(
                "tag fetch returned {}",
                resp.status()
            )));
        }

        let dtos: Vec<TagDto> = resp
            .json()
            .await
            .map_err(|e| Error::ProtocolError(format!("bad tag list: {}", e)))?;

        self.tags = dtos
            .into_iter()
            .filter_map(|d| {
                Tag::parse(&d.tag).map(|tag| {
                    (
                        d.tag.clone(),
                        VehicleRecord {
                            tag,
                            fleet_number: d.fleet_number,
                            tank_capacity_liters: d.tank_capacity_liters,
                            current_machine_hours: d.current_machine_hours,
                        },
                    )
                })
            })
            .collect();

        Ok(())
    }

    fn validate_tag(&self, tag: &Tag) -> Option<VehicleRecord> {
        match tag {
            Tag::None => None,
            Tag::Present(raw) => self.tags.get(raw).cloned(),
        }
    }

    async fn update_vehicle_hours(&mut self, tag: &Tag, hours: u32) -> Result<()> {
        // Best-effort: callers log and continue on error rather than
        // aborting a refill that already completed (spec §9).
        if self.ensure_logged_in().await.is_err() {
            warn!("couldn't refresh directory token for vehicle-hours update");
        }

        let raw = match tag {
            Tag::Present(raw) => raw,
            Tag::None => return Ok(()),
        };

        let url = format!("{}/vehicle-hours", self.cfg.base_url);
        let body = UpdateHoursRequest {
            tag: raw,
            machine_hours: hours,
        };

        let Some(token) = self.token.clone() else {
            return Err(Error::AuthenticationError);
        };

        self.client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::OperationError(format!("vehicle-hours update failed: {}", e)))?;

        Ok(())
    }
}

trait WithDetail {
    fn with_detail(self, e: reqwest::Error) -> Error;
}

impl WithDetail for Error {
    fn with_detail(self, e: reqwest::Error) -> Error {
        warn!("directory request error -- {}", e);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_tag_misses_before_refresh() {
        let dir = HttpFleetDirectory::new(DirectoryConfig {
            base_url: "http://localhost".into(),
            username: "u".into(),
            password: "p".into(),
        });

        assert_eq!(dir.validate_tag(&Tag::Present("E200001D8914005717701BFC".into())), None);
        assert_eq!(dir.validate_tag(&Tag::None), None);
    }

    #[test]
    fn token_needs_refresh_when_absent() {
        let dir = HttpFleetDirectory::new(DirectoryConfig {
            base_url: "http://localhost".into(),
            username: "u".into(),
            password: "p".into(),
        });

        assert!(dir.token_needs_refresh());
    }
}
