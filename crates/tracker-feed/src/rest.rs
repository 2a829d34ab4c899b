//! # Hosted REST Backend
//!
//! Adapter for a PostgREST-style hosted backend. Reads and writes go through
//! `/rest/v1/<table>`; subscriptions are emulated by polling on an interval
//! and diffing against the previous poll.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::{FeedError, Result};
use crate::raw::{FeedEvent, RawDeviceEvent, RawGeofenceEvent, RawLocationEvent};
use crate::traits::{BackendStore, ChangeFeed, FeedStream};
use tracker_domain::{Alert, Boundary, NewGeofence, OwnerScope, ProvisionRequest};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Hosted backend connection settings
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    pub api_key: SecretString,
    /// How often subscriptions re-read the tables
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Most recent location fixes read per poll
    pub location_limit: usize,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            poll_interval: Duration::from_secs(120),
            request_timeout: Duration::from_secs(10),
            location_limit: 200,
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// REST backend client, cheaply cloneable
#[derive(Clone)]
pub struct RestBackend {
    http: Client,
    config: Arc<RestConfig>,
}

impl RestBackend {
    /// Build a client with the API key installed as default headers
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Config`] if the key is not a valid header value
    /// or the HTTP client cannot be built.
    pub fn new(config: RestConfig) -> Result<Self> {
        let key = config.api_key.expose_secret();

        let mut apikey = HeaderValue::from_str(key)
            .map_err(|e| FeedError::Config(format!("invalid API key header value: {e}")))?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| FeedError::Config(format!("invalid API key header value: {e}")))?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("apikey", apikey);
        headers.insert(AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FeedError::Config(e.to_string()))?;

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{table}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Rows visible to a scope: owned by it, or unowned
    fn scope_filter(scope: &OwnerScope) -> (&'static str, String) {
        ("or", format!("(owner_id.eq.{scope},owner_id.is.null)"))
    }

    async fn send(request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(FeedError::Rejected {
            status: Some(status.as_u16()),
            message: rejection_message(&body),
        })
    }

    async fn select(&self, table: &str, params: &[(&str, String)]) -> Result<Vec<Map<String, Value>>> {
        let url = self.table_url(table);
        debug!(%url, ?params, "GET");

        let response = Self::send(self.http.get(url).query(params)).await?;
        Ok(response.json().await?)
    }

    /// POST and return the first row of the representation
    async fn insert(&self, table: &str, body: &Value) -> Result<Map<String, Value>> {
        let url = self.table_url(table);
        debug!(%url, "POST");

        let response = Self::send(
            self.http
                .post(url)
                .header("Prefer", "return=representation")
                .json(body),
        )
        .await?;

        let mut rows: Vec<Map<String, Value>> = response.json().await?;
        if rows.is_empty() {
            return Err(FeedError::Serialization(format!(
                "{table} insert returned no rows"
            )));
        }
        Ok(rows.swap_remove(0))
    }

    // =========================================================================
    // POLLING SUBSCRIPTIONS
    // =========================================================================

    fn poll_interval(&self) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }
}

/// PostgREST error bodies carry a `message`; fall back to the raw body
fn rejection_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn row_id(fields: &Map<String, Value>) -> Option<String> {
    match fields.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Serialize a boundary into the backend's `polygon` column shape
pub fn encode_boundary(boundary: &Boundary) -> Value {
    match boundary {
        Boundary::Circle { center, radius_m } => json!({
            "type": "circle",
            "center": { "lat": center.latitude, "lng": center.longitude },
            "radius": radius_m,
        }),
        Boundary::Polygon { vertices } => json!({
            "type": "polygon",
            "coordinates": vertices
                .iter()
                .map(|p| [p.latitude, p.longitude])
                .collect::<Vec<_>>(),
        }),
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    fn subscribe_devices(&self, scope: &OwnerScope) -> FeedStream<FeedEvent<RawDeviceEvent>> {
        let backend = self.clone();
        let scope = scope.clone();

        Box::pin(async_stream::stream! {
            let mut interval = backend.poll_interval();
            let mut known: HashSet<String> = HashSet::new();

            loop {
                interval.tick().await;
                let rows = match backend.fetch_devices(&scope).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                let mut seen = HashSet::with_capacity(rows.len());
                for raw in rows {
                    if let Some(id) = row_id(raw.fields()) {
                        seen.insert(id);
                    }
                    yield Ok(FeedEvent::Upsert(raw));
                }
                for id in known.difference(&seen) {
                    yield Ok(FeedEvent::Removed { id: id.clone() });
                }
                known = seen;
            }
        })
    }

    fn subscribe_locations(&self, scope: &OwnerScope) -> FeedStream<RawLocationEvent> {
        let backend = self.clone();
        let scope = scope.clone();
        let limit = self.config.location_limit;

        Box::pin(async_stream::stream! {
            let mut interval = backend.poll_interval();
            let mut known: HashSet<String> = HashSet::new();

            loop {
                interval.tick().await;
                let rows = match backend.fetch_locations(&scope, limit).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                // Rows arrive newest first; replay oldest first
                let mut seen = HashSet::with_capacity(rows.len());
                for raw in rows.into_iter().rev() {
                    match row_id(raw.fields()) {
                        Some(id) => {
                            let fresh = !known.contains(&id);
                            seen.insert(id);
                            if fresh {
                                yield Ok(raw);
                            }
                        }
                        None => yield Ok(raw),
                    }
                }
                known = seen;
            }
        })
    }

    fn subscribe_geofences(
        &self,
        scope: &OwnerScope,
    ) -> FeedStream<FeedEvent<RawGeofenceEvent>> {
        let backend = self.clone();
        let scope = scope.clone();

        Box::pin(async_stream::stream! {
            let mut interval = backend.poll_interval();
            let mut known: HashSet<String> = HashSet::new();

            loop {
                interval.tick().await;
                let rows = match backend.fetch_geofences(&scope).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                let mut seen = HashSet::with_capacity(rows.len());
                for raw in rows {
                    if let Some(id) = row_id(raw.fields()) {
                        seen.insert(id);
                    }
                    yield Ok(FeedEvent::Upsert(raw));
                }
                for id in known.difference(&seen) {
                    yield Ok(FeedEvent::Removed { id: id.clone() });
                }
                known = seen;
            }
        })
    }

    async fn fetch_devices(&self, scope: &OwnerScope) -> Result<Vec<RawDeviceEvent>> {
        let rows = self
            .select("devices", &[("select", "*".to_string()), Self::scope_filter(scope)])
            .await?;
        Ok(rows.into_iter().map(RawDeviceEvent::new).collect())
    }

    async fn fetch_locations(
        &self,
        _scope: &OwnerScope,
        limit: usize,
    ) -> Result<Vec<RawLocationEvent>> {
        let rows = self
            .select(
                "locations",
                &[
                    ("select", "*".to_string()),
                    ("order", "timestamp.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(RawLocationEvent::new).collect())
    }

    async fn fetch_geofences(&self, scope: &OwnerScope) -> Result<Vec<RawGeofenceEvent>> {
        let rows = self
            .select("geofences", &[("select", "*".to_string()), Self::scope_filter(scope)])
            .await?;
        Ok(rows.into_iter().map(RawGeofenceEvent::new).collect())
    }
}

#[async_trait]
impl BackendStore for RestBackend {
    async fn insert_device(
        &self,
        scope: &OwnerScope,
        request: &ProvisionRequest,
    ) -> Result<RawDeviceEvent> {
        let body = json!({
            "imei": request.imei,
            "name": request.name,
            "owner_id": scope.owner_id(),
            "owner_email": request.owner_email,
            "type": request.device_type.as_str(),
        });
        Ok(RawDeviceEvent::new(self.insert("devices", &body).await?))
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        let url = self.table_url("alerts");
        debug!(%url, alert_id = %alert.id, "POST upsert");

        Self::send(
            self.http
                .post(url)
                .header("Prefer", "resolution=merge-duplicates")
                .json(alert),
        )
        .await?;
        Ok(())
    }

    async fn insert_geofence(
        &self,
        scope: &OwnerScope,
        geofence: &NewGeofence,
    ) -> Result<RawGeofenceEvent> {
        let body = json!({
            "name": geofence.name,
            "owner_id": scope.owner_id(),
            "device_id": geofence.device_id,
            "polygon": encode_boundary(&geofence.boundary),
            "active": geofence.active,
            "on_enter": geofence.on_enter,
            "on_exit": geofence.on_exit,
        });
        Ok(RawGeofenceEvent::new(self.insert("geofences", &body).await?))
    }

    async fn set_geofence_active(&self, id: &str, active: bool) -> Result<()> {
        let url = self.table_url("geofences");
        debug!(%url, id, active, "PATCH");

        let response = Self::send(
            self.http
                .patch(url)
                .query(&[("id", format!("eq.{id}"))])
                .header("Prefer", "return=representation")
                .json(&json!({ "active": active })),
        )
        .await?;

        let rows: Vec<Value> = response.json().await?;
        if rows.is_empty() {
            return Err(FeedError::NotFound {
                entity_type: "geofence".to_string(),
                key: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_geofence(&self, id: &str) -> Result<()> {
        let url = self.table_url("geofences");
        debug!(%url, id, "DELETE");

        Self::send(self.http.delete(url).query(&[("id", format!("eq.{id}"))])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_domain::GeoPoint;

    #[test]
    fn rejection_prefers_backend_message() {
        let body = r#"{"code":"23505","message":"duplicate key value violates unique constraint \"devices_imei_key\""}"#;
        assert_eq!(
            rejection_message(body),
            "duplicate key value violates unique constraint \"devices_imei_key\""
        );
        assert_eq!(rejection_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn circle_encodes_center_and_radius() {
        let encoded = encode_boundary(&Boundary::Circle {
            center: GeoPoint::new(40.0, -74.0),
            radius_m: 250.0,
        });
        assert_eq!(encoded["type"], "circle");
        assert_eq!(encoded["center"]["lng"], -74.0);
        assert_eq!(encoded["radius"], 250.0);
    }

    #[test]
    fn polygon_encodes_lat_lon_pairs() {
        let encoded = encode_boundary(&Boundary::Polygon {
            vertices: vec![
                GeoPoint::new(0.0, 0.0),
                GeoPoint::new(0.0, 1.0),
                GeoPoint::new(1.0, 1.0),
            ],
        });
        assert_eq!(encoded["coordinates"][2], json!([1.0, 1.0]));
    }

    #[test]
    fn table_urls_ignore_trailing_slash() {
        let backend = RestBackend::new(RestConfig::new(
            "https://fleet.example.com/",
            SecretString::from("anon-key"),
        ))
        .unwrap();
        assert_eq!(
            backend.table_url("devices"),
            "https://fleet.example.com/rest/v1/devices"
        );
    }
}
