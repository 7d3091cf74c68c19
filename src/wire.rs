//! Server wire formats.
//!
//! Sync responses are GeoJSON-like feature collections:
//!
//! ```json
//! { "features": [ { "geometry": { "type": "Point", "coordinates": [lng, lat] },
//!                   "properties": { "code": "...", "name": "...", "radius": 100,
//!                                   "@created": { "timestamp": 1700000000000 } } } ],
//!   "properties": { "totalFeatures": 1, "lastSyncDate": "...", "deleted": ["..."] } }
//! ```
//!
//! Transition events go out as `{ sdkVersion, notifications: [...] }` with one
//! notification per geofence.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::native::TransitionKind;
use crate::{Geofence, GeofenceError, Result, SDK_VERSION};

/// `detectedTime` layout: local time with offset, millisecond precision.
pub const DETECTED_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

// ============================================================================
// Sync page
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPage {
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub properties: PageProperties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_features: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_date: Option<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: Geometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// `[longitude, latitude]`
    pub coordinates: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureProperties {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub radius: f64,
    #[serde(rename = "@created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<ServerTimestamp>,
    #[serde(rename = "@updated", default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<ServerTimestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimestamp {
    /// Epoch millis
    pub timestamp: i64,
}

impl Feature {
    pub fn from_geofence(geofence: &Geofence) -> Self {
        Self {
            geometry: Geometry {
                kind: "Point".to_string(),
                coordinates: vec![geofence.longitude, geofence.latitude],
            },
            properties: FeatureProperties {
                code: geofence.code.clone(),
                name: geofence.name.clone(),
                description: geofence.description.clone(),
                radius: geofence.radius,
                created: geofence
                    .created_timestamp
                    .map(|timestamp| ServerTimestamp { timestamp }),
                updated: geofence
                    .updated_timestamp
                    .map(|timestamp| ServerTimestamp { timestamp }),
            },
        }
    }

    /// Convert to a validated [`Geofence`]. Any defect is a parse error.
    pub fn into_geofence(self) -> Result<Geofence> {
        let code = self.properties.code;
        if !self.geometry.kind.eq_ignore_ascii_case("point") {
            return Err(GeofenceError::parse(format!(
                "feature '{}' has unsupported geometry type '{}'",
                code, self.geometry.kind
            )));
        }
        let (longitude, latitude) = match self.geometry.coordinates.as_slice() {
            [lng, lat, ..] => (*lng, *lat),
            _ => {
                return Err(GeofenceError::parse(format!(
                    "feature '{}' has incomplete coordinates",
                    code
                )))
            }
        };

        let geofence = Geofence {
            code,
            name: self.properties.name,
            description: self.properties.description,
            latitude,
            longitude,
            radius: self.properties.radius,
            created_timestamp: self.properties.created.map(|t| t.timestamp),
            updated_timestamp: self.properties.updated.map(|t| t.timestamp),
        };
        geofence
            .validate()
            .map_err(|e| GeofenceError::parse(e.to_string()))?;
        Ok(geofence)
    }
}

impl SyncPage {
    /// Page carrying `geofences` and `deleted`, as the server would send it.
    pub fn new(geofences: &[Geofence], deleted: &[String]) -> Self {
        Self {
            features: geofences.iter().map(Feature::from_geofence).collect(),
            properties: PageProperties {
                total_features: Some(geofences.len() as u64),
                last_sync_date: None,
                deleted: deleted.to_vec(),
            },
        }
    }

    pub fn with_last_sync_date(mut self, last_sync_date: &str) -> Self {
        self.properties.last_sync_date = Some(last_sync_date.to_string());
        self
    }

    pub fn with_total_features(mut self, total: u64) -> Self {
        self.properties.total_features = Some(total);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A sync page converted into domain values.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub geofences: Vec<Geofence>,
    pub deleted: Vec<String>,
    pub total_features: Option<u64>,
    pub last_sync_date: Option<String>,
}

/// Parse one sync response body. Fails on the first malformed feature.
pub fn parse_sync_page(body: Value) -> Result<ParsedPage> {
    if body.is_null() {
        return Err(GeofenceError::parse("empty sync response"));
    }
    let page: SyncPage = serde_json::from_value(body)?;
    let geofences = page
        .features
        .into_iter()
        .map(Feature::into_geofence)
        .collect::<Result<Vec<_>>>()?;

    Ok(ParsedPage {
        geofences,
        deleted: page.properties.deleted,
        total_features: page.properties.total_features,
        last_sync_date: page.properties.last_sync_date,
    })
}

// ============================================================================
// Event payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub sdk_version: String,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub descriptor: String,
    pub detected_time: String,
    pub data: CrossingData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossingData {
    pub geofence_code: String,
    pub geofence_name: String,
    pub crossing_type: TransitionKind,
}

pub fn format_detected_time(detected_at: &DateTime<FixedOffset>) -> String {
    detected_at.format(DETECTED_TIME_FORMAT).to_string()
}

impl EventPayload {
    /// One notification per geofence, all sharing the same detection time.
    pub fn new(
        kind: TransitionKind,
        geofences: &[Geofence],
        descriptor: &str,
        detected_at: &DateTime<FixedOffset>,
    ) -> Self {
        let detected_time = format_detected_time(detected_at);
        Self {
            sdk_version: SDK_VERSION.to_string(),
            notifications: geofences
                .iter()
                .map(|geofence| Notification {
                    descriptor: descriptor.to_string(),
                    detected_time: detected_time.clone(),
                    data: CrossingData {
                        geofence_code: geofence.code.clone(),
                        geofence_name: geofence.name.clone(),
                        crossing_type: kind,
                    },
                })
                .collect(),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_sync_page() {
        let body = json!({
            "features": [{
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [-0.1278, 51.5074] },
                "properties": {
                    "code": "london",
                    "name": "London",
                    "description": "HQ",
                    "radius": 250,
                    "@created": { "timestamp": 1_700_000_000_000i64 },
                    "@updated": { "timestamp": 1_700_000_100_000i64 }
                }
            }],
            "properties": { "totalFeatures": 1, "lastSyncDate": "2024-05-01T00:00:00Z", "deleted": ["old"] }
        });

        let page = parse_sync_page(body).unwrap();
        assert_eq!(page.geofences.len(), 1);
        let gf = &page.geofences[0];
        assert_eq!(gf.code, "london");
        assert_eq!(gf.latitude, 51.5074);
        assert_eq!(gf.longitude, -0.1278);
        assert_eq!(gf.radius, 250.0);
        assert_eq!(gf.description.as_deref(), Some("HQ"));
        assert_eq!(gf.created_timestamp, Some(1_700_000_000_000));
        assert_eq!(gf.updated_timestamp, Some(1_700_000_100_000));
        assert_eq!(page.deleted, vec!["old"]);
        assert_eq!(page.total_features, Some(1));
        assert_eq!(page.last_sync_date.as_deref(), Some("2024-05-01T00:00:00Z"));
    }

    #[test]
    fn test_wire_round_trip_preserves_fields() {
        let mut original = Geofence::new("gf-9", "Depot", 40.7128, -74.006, 80.0);
        original.description = Some("Loading bay".to_string());
        original.updated_timestamp = Some(42);

        let value = SyncPage::new(&[original.clone()], &[]).to_value();
        let parsed = parse_sync_page(value).unwrap();
        assert!(parsed.geofences[0].same_content(&original));
    }

    #[test]
    fn test_malformed_features_are_parse_errors() {
        let missing_coordinates = json!({
            "features": [{ "geometry": { "type": "Point", "coordinates": [1.0] },
                           "properties": { "code": "a", "radius": 10 } }]
        });
        assert!(matches!(
            parse_sync_page(missing_coordinates),
            Err(GeofenceError::Parse { .. })
        ));

        let polygon = json!({
            "features": [{ "geometry": { "type": "Polygon", "coordinates": [1.0, 2.0] },
                           "properties": { "code": "a", "radius": 10 } }]
        });
        assert!(matches!(parse_sync_page(polygon), Err(GeofenceError::Parse { .. })));

        let bad_radius = json!({
            "features": [{ "geometry": { "type": "Point", "coordinates": [1.0, 2.0] },
                           "properties": { "code": "a", "radius": 0 } }]
        });
        assert!(matches!(parse_sync_page(bad_radius), Err(GeofenceError::Parse { .. })));

        assert!(matches!(
            parse_sync_page(json!({ "features": "nope" })),
            Err(GeofenceError::Parse { .. })
        ));
        assert!(matches!(parse_sync_page(Value::Null), Err(GeofenceError::Parse { .. })));
    }

    #[test]
    fn test_empty_page_defaults() {
        let page = parse_sync_page(json!({})).unwrap();
        assert!(page.geofences.is_empty());
        assert!(page.deleted.is_empty());
        assert_eq!(page.total_features, None);
    }

    #[test]
    fn test_event_payload_shape() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let detected_at = offset.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).unwrap();
        let geofences = vec![
            Geofence::new("a", "Alpha", 1.0, 1.0, 10.0),
            Geofence::new("b", "Beta", 2.0, 2.0, 10.0),
        ];

        let payload = EventPayload::new(TransitionKind::Enter, &geofences, "device-7", &detected_at);
        let value = payload.to_value().unwrap();

        assert_eq!(value["sdkVersion"], SDK_VERSION);
        let notifications = value["notifications"].as_array().unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0]["descriptor"], "device-7");
        assert_eq!(notifications[0]["detectedTime"], "2026-10-17T09:30:00.000+02:00");
        assert_eq!(notifications[0]["data"]["geofenceCode"], "a");
        assert_eq!(notifications[1]["data"]["geofenceName"], "Beta");
        assert_eq!(notifications[1]["data"]["crossingType"], "enter");
    }
}
