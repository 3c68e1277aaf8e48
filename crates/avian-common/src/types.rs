//! Shared domain types

use crate::error::{AvianError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Date layouts accepted from flat-file sources, tried in order
pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y%m%d"];

const NAIVE_DATETIME_FORMATS: &[&str] =
    &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// A latitude/longitude point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Axis-aligned geographic bounding box (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub const fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// The whole globe
    pub const fn world() -> Self {
        Self::new(-90.0, 90.0, -180.0, 180.0)
    }

    /// Build from north-east and south-west corners
    pub fn from_corners(ne: GeoPoint, sw: GeoPoint) -> Self {
        Self::new(sw.lat, ne.lat, sw.lon, ne.lon)
    }

    pub fn north_east(&self) -> GeoPoint {
        GeoPoint {
            lat: self.max_lat,
            lon: self.max_lon,
        }
    }

    pub fn south_west(&self) -> GeoPoint {
        GeoPoint {
            lat: self.min_lat,
            lon: self.min_lon,
        }
    }

    pub fn contains_lat(&self, lat: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat)
    }

    pub fn contains_lon(&self, lon: f64) -> bool {
        (self.min_lon..=self.max_lon).contains(&lon)
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.contains_lat(lat) && self.contains_lon(lon)
    }

    /// Reject inverted or out-of-range boxes
    pub fn validate(&self) -> Result<()> {
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err(AvianError::Config(format!("inverted bounding box: {:?}", self)));
        }
        if !Self::world().contains(self.min_lat, self.min_lon)
            || !Self::world().contains(self.max_lat, self.max_lon)
        {
            return Err(AvianError::Config(format!(
                "bounding box outside world coordinates: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Parse a date using [`DATE_FORMATS`]
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
}

/// Parse an instant from RFC 3339, a naive datetime (assumed UTC), or a bare date
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .or_else(|| parse_date(input).and_then(|d| d.and_hms_opt(0, 0, 0)))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Like [`parse_timestamp`] but reports the offending input
pub fn require_timestamp(input: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(input).ok_or_else(|| AvianError::Parse(format!("unrecognized timestamp: {input}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const NETHERLANDS: BoundingBox = BoundingBox::new(50.75, 53.47, 3.37, 7.21);

    #[test]
    fn test_bbox_contains() {
        assert!(NETHERLANDS.contains(52.1, 5.18));
        assert!(NETHERLANDS.contains(50.75, 3.37));
        assert!(!NETHERLANDS.contains(48.85, 2.35));
        assert!(!NETHERLANDS.contains_lon(7.5));
    }

    #[test]
    fn test_bbox_from_corners() {
        let bbox = BoundingBox::from_corners(
            GeoPoint { lat: 53.7, lon: 7.22 },
            GeoPoint { lat: 50.75, lon: 3.33 },
        );
        assert_eq!(bbox.min_lat, 50.75);
        assert_eq!(bbox.max_lon, 7.22);
        assert_eq!(bbox.north_east(), GeoPoint { lat: 53.7, lon: 7.22 });
    }

    #[test]
    fn test_bbox_validate() {
        assert!(NETHERLANDS.validate().is_ok());
        assert!(BoundingBox::new(53.0, 50.0, 3.0, 7.0).validate().is_err());
        assert!(BoundingBox::new(50.0, 95.0, 3.0, 7.0).validate().is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 8, 14).unwrap();
        assert_eq!(parse_date("2024-08-14"), Some(expected));
        assert_eq!(parse_date("14-08-2024"), Some(expected));
        assert_eq!(parse_date("14/08/2024"), Some(expected));
        assert_eq!(parse_date("20240814"), Some(expected));
        assert_eq!(parse_date("August 14"), None);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let ts = parse_timestamp("2024-08-14T06:30:00+02:00").unwrap();
        assert_eq!(ts.hour(), 4);

        let ts = parse_timestamp("2024-08-14T06:30:00Z").unwrap();
        assert_eq!(ts.hour(), 6);

        let ts = parse_timestamp("2024-08-14 06:30:00").unwrap();
        assert_eq!(ts.minute(), 30);

        let ts = parse_timestamp("2024-08-14").unwrap();
        assert_eq!((ts.day(), ts.hour()), (14, 0));

        assert!(parse_timestamp("").is_none());
        assert!(require_timestamp("yesterday").is_err());
    }
}
