use std::cmp::Ordering;

use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A validated latitude/longitude pair.
///
/// Both coordinates are finite, so points are totally ordered: by latitude,
/// then by longitude. This is the order geo point field values sort in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument(format!(
                "Latitude must be a number between -90 and 90, but was: {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument(format!(
                "Longitude must be a number between -180 and 180, but was: {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// The `geoPointValue` payload of the JSON wire format.
    pub fn to_proto(&self) -> JsonValue {
        json!({
            "latitude": self.latitude,
            "longitude": self.longitude,
        })
    }

    /// Parses a `geoPointValue` payload. Absent coordinates are zero, as in
    /// proto3 JSON.
    pub fn from_proto(value: &JsonValue) -> FirestoreResult<Self> {
        let coordinate = |name: &str| -> FirestoreResult<f64> {
            match value.get(name) {
                None | Some(JsonValue::Null) => Ok(0.0),
                Some(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument(format!("geoPointValue.{name} must be a number"))),
            }
        };
        Self::new(coordinate("latitude")?, coordinate("longitude")?)
    }
}

impl Eq for GeoPoint {}

impl PartialOrd for GeoPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GeoPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        // Coordinates are never NaN; -0.0 and 0.0 compare equal.
        self.latitude
            .partial_cmp(&other.latitude)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                self.longitude
                    .partial_cmp(&other.longitude)
                    .unwrap_or(Ordering::Equal)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_and_non_finite_coordinates() {
        let err = GeoPoint::new(100.0, 0.0).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(GeoPoint::new(0.0, 180.5).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn orders_by_latitude_then_longitude() {
        let south = GeoPoint::new(-10.0, 50.0).unwrap();
        let west = GeoPoint::new(10.0, -50.0).unwrap();
        let east = GeoPoint::new(10.0, 50.0).unwrap();
        let mut points = vec![east, south, west];
        points.sort();
        assert_eq!(points, vec![south, west, east]);
        assert_eq!(
            GeoPoint::new(0.0, -0.0).unwrap().cmp(&GeoPoint::new(-0.0, 0.0).unwrap()),
            Ordering::Equal
        );
    }

    #[test]
    fn proto_payload_defaults_missing_coordinates() {
        let point = GeoPoint::from_proto(&json!({ "latitude": 12.5 })).unwrap();
        assert_eq!((point.latitude(), point.longitude()), (12.5, 0.0));
        assert_eq!(GeoPoint::from_proto(&point.to_proto()).unwrap(), point);
        assert!(GeoPoint::from_proto(&json!({ "latitude": "north" })).is_err());
        assert!(GeoPoint::from_proto(&json!({ "latitude": 91.0 })).is_err());
    }
}
