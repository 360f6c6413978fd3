//! REST half of the vendor API: login and the device snapshot.
//!
//! - `POST /api/login` with form `username`/`password`, API key at
//!   `result.auth.apiKey`
//! - `GET /api/devices` lists the account's devices (`varName`,
//!   `metaData.name`)
//! - `GET /api/devices/<id>` returns the `deviceTypeMap` of one device

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use url::Url;

use ryobi_gdo2mqtt_domain::id::DeviceId;
use ryobi_gdo2mqtt_domain::session::AuthToken;
use ryobi_gdo2mqtt_domain::time::now;

use crate::codec::{self, DecodedDevice};
use crate::config::CloudConfig;
use crate::error::CloudError;

#[derive(Debug, Default, Deserialize)]
pub struct MetaData {
    #[serde(default)]
    pub name: Option<String>,
}

/// One entry of the device list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub var_name: String,
    #[serde(default)]
    pub meta_data: MetaData,
}

/// Full state of one device.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetail {
    #[serde(default)]
    pub meta_data: MetaData,
    #[serde(default)]
    pub device_type_ids: Vec<String>,
    #[serde(default)]
    pub device_type_map: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ResultList<T> {
    #[serde(default = "Vec::new")]
    result: Vec<T>,
}

/// Thin client over the vendor REST endpoints.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    email: String,
    password: SecretString,
}

impl RestClient {
    /// # Errors
    ///
    /// Returns [`CloudError::InvalidUrl`] for a bad host and
    /// [`CloudError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(CloudError::Http)?;
        Ok(Self {
            http,
            base: config.rest_url()?,
            email: config.email.clone(),
            password: config.password.clone(),
        })
    }

    /// Exchange the account credentials for an API key.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Unauthorized`] when the cloud refuses the
    /// credentials or answers without a key.
    #[tracing::instrument(skip(self))]
    pub async fn login(&self) -> Result<AuthToken, CloudError> {
        let url = self.endpoint("api/login")?;
        let response = self
            .http
            .post(url)
            .form(&self.credentials())
            .send()
            .await
            .map_err(CloudError::Http)?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(CloudError::Unauthorized(format!("login refused (HTTP {status})")));
        }
        if !status.is_success() {
            return Err(CloudError::Status(status));
        }

        let reply: Value = response.json().await.map_err(CloudError::Http)?;
        let api_key = reply
            .pointer("/result/auth/apiKey")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| CloudError::Unauthorized("login reply carries no API key".to_string()))?;
        tracing::debug!("login successful");
        Ok(AuthToken::new(api_key, now()))
    }

    /// List every device on the account.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Http`] or [`CloudError::Status`] on transport
    /// failures.
    pub async fn devices(&self) -> Result<Vec<DeviceSummary>, CloudError> {
        let list: ResultList<DeviceSummary> = self.get("api/devices").await?;
        Ok(list.result)
    }

    /// Fetch the full state of one device.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Protocol`] when the cloud has no detail for it.
    pub async fn device(&self, device_id: &str) -> Result<DeviceDetail, CloudError> {
        let list: ResultList<DeviceDetail> = self.get(&format!("api/devices/{device_id}")).await?;
        list.result
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::Protocol(format!("no detail for device {device_id}")))
    }

    /// Ids of the account's devices that pass the allowlist.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Http`] or [`CloudError::Status`] on transport
    /// failures.
    #[tracing::instrument(skip(self, config))]
    pub async fn bridged_devices(&self, config: &CloudConfig) -> Result<Vec<DeviceId>, CloudError> {
        let mut bridged = Vec::new();
        for summary in self.devices().await? {
            if !config.is_bridged(&summary.var_name) {
                tracing::debug!(device_id = %summary.var_name, "device not in allowlist");
                continue;
            }
            match DeviceId::new(summary.var_name.as_str()) {
                Ok(id) => bridged.push(id),
                Err(err) => {
                    tracing::warn!(device_id = %summary.var_name, error = %err, "skipping device");
                }
            }
        }
        Ok(bridged)
    }

    /// Fetch and decode the given devices.
    ///
    /// A device that cannot be decoded is logged and left out of the
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns the first transport failure.
    #[tracing::instrument(skip(self))]
    pub async fn snapshot(&self, devices: &[DeviceId]) -> Result<Vec<DecodedDevice>, CloudError> {
        let mut decoded = Vec::new();
        for device_id in devices {
            let detail = self.device(device_id.as_str()).await?;
            let name = detail
                .meta_data
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| device_id.to_string());
            let model = detail.device_type_ids.first().map(String::as_str);
            match codec::decode_device(device_id.clone(), &name, model, &detail.device_type_map, now()) {
                Ok(device) => decoded.push(device),
                Err(err) => {
                    tracing::warn!(device_id = %device_id, error = %err, "skipping undecodable device");
                }
            }
        }
        Ok(decoded)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .form(&self.credentials())
            .send()
            .await
            .map_err(CloudError::Http)?;
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(CloudError::Unauthorized(format!("{path} refused (HTTP {status})")));
        }
        if !status.is_success() {
            return Err(CloudError::Status(status));
        }
        response.json().await.map_err(CloudError::Http)
    }

    fn endpoint(&self, path: &str) -> Result<Url, CloudError> {
        self.base.join(path).map_err(CloudError::InvalidUrl)
    }

    fn credentials(&self) -> [(&str, &str); 2] {
        [
            ("username", self.email.as_str()),
            ("password", self.password.expose_secret()),
        ]
    }
}
