use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQuery {
    pub identifier: String,
    pub year: Option<String>,
}

impl LookupQuery {
    pub fn new(identifier: impl Into<String>, year: Option<String>) -> Self {
        Self {
            identifier: identifier.into(),
            year: year.filter(|y| !y.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleDetails {
    pub manufacturer: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub vehicle_type: Option<String>,
    pub body_class: Option<String>,
    pub gvwr: Option<String>,
}

impl VehicleDetails {
    /// Values in derived-column order, with `placeholder` standing in for missing fields.
    pub fn column_values(&self, placeholder: &str) -> [String; 6] {
        [
            &self.manufacturer,
            &self.make,
            &self.model,
            &self.vehicle_type,
            &self.body_class,
            &self.gvwr,
        ]
        .map(|value| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(placeholder)
                .to_string()
        })
    }
}

/// Remote decoder for a single VIN.
///
/// Implementations must return [`AppError::Cancelled`] promptly once `cancel`
/// fires, whether it fired before the call or while it was in flight.
#[async_trait]
pub trait VehicleLookup: Send + Sync {
    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> AppResult<VehicleDetails>;
}

#[derive(Clone)]
pub struct LookupService {
    inner: Arc<dyn VehicleLookup>,
}

impl LookupService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = HttpVehicleLookup::new(config)?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    pub fn from_lookup(lookup: Arc<dyn VehicleLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> AppResult<VehicleDetails> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.inner.lookup(query, cancel).await
    }
}

pub struct HttpVehicleLookup {
    http: Client,
    endpoint: Url,
}

impl HttpVehicleLookup {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let endpoint = Url::parse(config.lookup_endpoint.trim_end_matches('/')).map_err(|err| {
            AppError::Config(format!(
                "invalid lookup endpoint {}: {err}",
                config.lookup_endpoint
            ))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "lookup endpoint {} cannot carry a path",
                config.lookup_endpoint
            )));
        }
        let http = Client::builder()
            .user_agent(concat!("vin-enrich/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.lookup_timeout_ms))
            .build()?;
        Ok(Self { http, endpoint })
    }

    fn request_url(&self, query: &LookupQuery) -> AppResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("lookup endpoint cannot carry a path".into()))?
            .pop_if_empty()
            .push(&query.identifier);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("format", "json");
            if let Some(year) = &query.year {
                pairs.append_pair("modelyear", year);
            }
        }
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> AppResult<VehicleDetails> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "Results", default)]
            results: Vec<DecodedVehicle>,
        }

        #[derive(Deserialize)]
        struct DecodedVehicle {
            #[serde(rename = "Manufacturer")]
            manufacturer: Option<String>,
            #[serde(rename = "Make")]
            make: Option<String>,
            #[serde(rename = "Model")]
            model: Option<String>,
            #[serde(rename = "VehicleType")]
            vehicle_type: Option<String>,
            #[serde(rename = "BodyClass")]
            body_class: Option<String>,
            #[serde(rename = "GVWR")]
            gvwr: Option<String>,
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::lookup_failed(err.status().map(|s| s.as_u16()), err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::lookup_failed(
                Some(status.as_u16()),
                format!("decode request returned {status}"),
            ));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| AppError::lookup_failed(Some(status.as_u16()), err.to_string()))?;
        let vehicle = parsed.results.into_iter().next().ok_or_else(|| {
            AppError::lookup_failed(Some(status.as_u16()), "decode response contained no results")
        })?;

        Ok(VehicleDetails {
            manufacturer: non_blank(vehicle.manufacturer),
            make: non_blank(vehicle.make),
            model: non_blank(vehicle.model),
            vehicle_type: non_blank(vehicle.vehicle_type),
            body_class: non_blank(vehicle.body_class),
            gvwr: non_blank(vehicle.gvwr),
        })
    }
}

#[async_trait]
impl VehicleLookup for HttpVehicleLookup {
    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> AppResult<VehicleDetails> {
        let url = self.request_url(query)?;
        debug!(identifier = %query.identifier, year = ?query.year, "decoding vin");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(identifier = %query.identifier, "vin decode aborted");
                Err(AppError::Cancelled)
            }
            result = self.fetch(url) => result,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
