use std::collections::HashMap;
use std::env;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Selects which backend the published encryptor catalogs are read
/// from. "prod" unless overridden.
pub const ENVIRONMENT_VAR: &str = "SEALER_ENVIRONMENT";
pub const DEFAULT_ENVIRONMENT: &str = "prod";

fn catalog_url(environment: &str, hvm: bool) -> String {
    if hvm {
        format!("https://sealer-images-{environment}.s3.amazonaws.com/hvm_amis.json")
    } else {
        format!("https://sealer-images-{environment}.s3.amazonaws.com/amis.json")
    }
}

/// Resolve the current encryptor image for `region` from the published
/// region-to-image catalog.
pub async fn resolve_encryptor_image(region: &str, hvm: bool) -> Result<String> {
    let environment =
        env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string());
    let url = catalog_url(&environment, hvm);
    debug!(url, "fetching encryptor image catalog");

    let catalog: HashMap<String, String> = reqwest::get(&url)
        .await?
        .error_for_status()?
        .json()
        .await?;
    catalog
        .get(region)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("encryptor image for region {region}")))
}

/// Service endpoints an appliance phones home to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEnv {
    pub api_host: String,
    pub api_port: u16,
    pub keyserver_host: String,
    pub keyserver_port: u16,
}

impl ServiceEnv {
    /// Parse "api-host:port,keyserver-host:port".
    pub fn parse(s: &str) -> Result<ServiceEnv> {
        let (api, keyserver) = s
            .split_once(',')
            .ok_or_else(|| Error::InvalidInput(format!("malformed service env {s:?}")))?;
        let (api_host, api_port) = parse_host_port(api)?;
        let (keyserver_host, keyserver_port) = parse_host_port(keyserver)?;
        Ok(ServiceEnv {
            api_host,
            api_port,
            keyserver_host,
            keyserver_port,
        })
    }
}

fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .split_once(':')
        .ok_or_else(|| Error::InvalidInput(format!("expected host:port, got {s:?}")))?;
    if host.is_empty() {
        return Err(Error::InvalidInput(format!("empty host in {s:?}")));
    }
    let port = port
        .parse()
        .map_err(|_| Error::InvalidInput(format!("bad port in {s:?}")))?;
    Ok((host.to_string(), port))
}

/// User-data document handed to appliance instances at launch.
#[derive(Clone, Debug, Default)]
pub struct UserData {
    pub service_env: Option<ServiceEnv>,
    pub token: Option<String>,
    pub ntp_servers: Vec<String>,
    /// Boot the appliance as an updater instead of chain loading.
    pub updater_mode: bool,
}

impl UserData {
    pub fn to_json(&self) -> String {
        let mut sealer = Map::new();
        if let Some(env) = &self.service_env {
            sealer.insert(
                "api_host".to_string(),
                json!(format!("{}:{}", env.api_host, env.api_port)),
            );
            sealer.insert(
                "keyserver_host".to_string(),
                json!(format!("{}:{}", env.keyserver_host, env.keyserver_port)),
            );
        }
        if let Some(token) = &self.token {
            sealer.insert("identity_token".to_string(), json!(token));
        }
        if self.updater_mode {
            sealer.insert("solo_mode".to_string(), json!("updater"));
        }

        let mut root = Map::new();
        root.insert("sealer".to_string(), Value::Object(sealer));
        if !self.ntp_servers.is_empty() {
            root.insert("ntp-servers".to_string(), json!(self.ntp_servers));
        }
        Value::Object(root).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_env_round_trips() {
        let env = ServiceEnv::parse("api.sealer.example:443,keys.sealer.example:7001").unwrap();
        assert_eq!(env.api_host, "api.sealer.example");
        assert_eq!(env.api_port, 443);
        assert_eq!(env.keyserver_host, "keys.sealer.example");
        assert_eq!(env.keyserver_port, 7001);
    }

    #[test]
    fn malformed_service_env_is_rejected() {
        assert!(ServiceEnv::parse("api.sealer.example:443").is_err());
        assert!(ServiceEnv::parse("api.sealer.example,keys:1").is_err());
        assert!(ServiceEnv::parse(":443,keys:1").is_err());
        assert!(ServiceEnv::parse("api:notaport,keys:1").is_err());
    }

    #[test]
    fn user_data_includes_only_what_is_set() {
        let data = UserData::default().to_json();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert!(value["sealer"].as_object().unwrap().is_empty());
        assert!(value.get("ntp-servers").is_none());

        let data = UserData {
            service_env: Some(ServiceEnv::parse("api:443,keys:7001").unwrap()),
            token: Some("tok".to_string()),
            ntp_servers: vec!["0.pool.ntp.org".to_string()],
            updater_mode: true,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["sealer"]["api_host"], "api:443");
        assert_eq!(value["sealer"]["keyserver_host"], "keys:7001");
        assert_eq!(value["sealer"]["identity_token"], "tok");
        assert_eq!(value["sealer"]["solo_mode"], "updater");
        assert_eq!(value["ntp-servers"][0], "0.pool.ntp.org");
    }

    #[test]
    fn catalog_url_tracks_environment_and_type() {
        assert_eq!(
            catalog_url("prod", false),
            "https://sealer-images-prod.s3.amazonaws.com/amis.json"
        );
        assert_eq!(
            catalog_url("stage", true),
            "https://sealer-images-stage.s3.amazonaws.com/hvm_amis.json"
        );
    }
}
