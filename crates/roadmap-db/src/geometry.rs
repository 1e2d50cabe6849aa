//! Map coordinates and bounding areas
//!
//! Map files store coordinates as integer micro-degrees. [`Position`] and [`Area`] keep that
//! representation and convert to and from `geo` types (in degrees) at the API boundary.

use geo::{Coord, Point, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Micro-degrees per degree
pub const MICRO_DEGREES: f64 = 1_000_000.0;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A map position in micro-degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Position {
    pub longitude: i32,
    pub latitude: i32,
}

impl Position {
    #[inline]
    pub const fn new(longitude: i32, latitude: i32) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Convert WGS84 degrees to a micro-degree position (rounded to the nearest unit)
    #[inline]
    pub fn from_degrees(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude: (longitude * MICRO_DEGREES).round() as i32,
            latitude: (latitude * MICRO_DEGREES).round() as i32,
        }
    }

    /// Return (longitude, latitude) in degrees
    #[inline]
    pub fn to_degrees(self) -> (f64, f64) {
        (
            self.longitude as f64 / MICRO_DEGREES,
            self.latitude as f64 / MICRO_DEGREES,
        )
    }

    /// Great-circle distance to another position in meters (haversine formula)
    pub fn distance_meters(self, other: Position) -> f64 {
        let (lon1, lat1) = self.to_degrees();
        let (lon2, lat2) = other.to_degrees();

        let lat1_rad = lat1.to_radians();
        let lat2_rad = lat2.to_radians();
        let delta_lat = (lat2 - lat1).to_radians();
        let delta_lon = (lon2 - lon1).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }
}

impl From<Coord<f64>> for Position {
    fn from(coord: Coord<f64>) -> Self {
        Position::from_degrees(coord.x, coord.y)
    }
}

impl From<Point<f64>> for Position {
    fn from(point: Point<f64>) -> Self {
        Position::from_degrees(point.x(), point.y())
    }
}

impl From<Position> for Coord<f64> {
    fn from(position: Position) -> Self {
        let (x, y) = position.to_degrees();
        Coord { x, y }
    }
}

/// An axis-aligned bounding area in micro-degrees, edges inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Area {
    pub west: i32,
    pub south: i32,
    pub east: i32,
    pub north: i32,
}

impl Area {
    #[inline]
    pub const fn new(west: i32, south: i32, east: i32, north: i32) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Build an area from degree edges
    pub fn from_degrees(west: f64, south: f64, east: f64, north: f64) -> Self {
        let min = Position::from_degrees(west, south);
        let max = Position::from_degrees(east, north);
        Self::new(min.longitude, min.latitude, max.longitude, max.latitude)
    }

    /// Square window of `radius_meters` around `center`
    ///
    /// The longitude extent is widened by the latitude so the window covers the whole circle.
    pub fn around(center: Position, radius_meters: f64) -> Self {
        let (lon, lat) = center.to_degrees();
        let delta_lat = (radius_meters / EARTH_RADIUS_M).to_degrees();
        let delta_lon = delta_lat / lat.to_radians().cos().max(1e-6);
        Self::from_degrees(
            (lon - delta_lon).max(-180.0),
            (lat - delta_lat).max(-90.0),
            (lon + delta_lon).min(180.0),
            (lat + delta_lat).min(90.0),
        )
    }

    /// West/south corner
    #[inline]
    pub fn min_corner(&self) -> Position {
        Position::new(self.west, self.south)
    }

    /// East/north corner
    #[inline]
    pub fn max_corner(&self) -> Position {
        Position::new(self.east, self.north)
    }

    /// Whether the edges are ordered (west <= east, south <= north)
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.west <= self.east && self.south <= self.north
    }

    /// Whether the position lies inside the area or on its edges
    #[inline]
    pub fn contains(&self, position: Position) -> bool {
        position.longitude >= self.west
            && position.longitude <= self.east
            && position.latitude >= self.south
            && position.latitude <= self.north
    }

    /// Whether the two areas share at least one point
    #[inline]
    pub fn intersects(&self, other: &Area) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    /// Point of the area closest to `position` (the position itself when inside)
    #[inline]
    pub fn nearest(&self, position: Position) -> Position {
        Position::new(
            position.longitude.clamp(self.west, self.east),
            position.latitude.clamp(self.south, self.north),
        )
    }
}

impl From<Rect<f64>> for Area {
    fn from(rect: Rect<f64>) -> Self {
        let min = rect.min();
        let max = rect.max();
        Area::from_degrees(min.x, min.y, max.x, max.y)
    }
}

impl From<Area> for Rect<f64> {
    fn from(area: Area) -> Self {
        Rect::new(
            Coord::from(area.min_corner()),
            Coord::from(area.max_corner()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_degrees_roundtrip() {
        let position = Position::from_degrees(-0.1278, 51.5074);
        assert_eq!(position, Position::new(-127_800, 51_507_400));

        let (lon, lat) = position.to_degrees();
        assert!((lon + 0.1278).abs() < 1e-9);
        assert!((lat - 51.5074).abs() < 1e-9);
    }

    #[test]
    fn test_position_from_geo() {
        let position: Position = Coord { x: 1.5, y: 2.5 }.into();
        assert_eq!(position, Position::new(1_500_000, 2_500_000));

        let position: Position = Point::new(-3.0, 4.0).into();
        assert_eq!(position, Position::new(-3_000_000, 4_000_000));
    }

    #[test]
    fn test_distance_meters() {
        let london = Position::from_degrees(-0.1278, 51.5074);
        let paris = Position::from_degrees(2.3522, 48.8566);
        let distance = london.distance_meters(paris);
        // Roughly 344 km
        assert!(distance > 340_000.0 && distance < 348_000.0);
        assert_eq!(london.distance_meters(london), 0.0);
    }

    #[test]
    fn test_area_contains_edges_inclusive() {
        let area = Area::new(0, 0, 10, 10);
        assert!(area.contains(Position::new(0, 0)));
        assert!(area.contains(Position::new(10, 10)));
        assert!(area.contains(Position::new(5, 5)));
        assert!(!area.contains(Position::new(11, 5)));
        assert!(!area.contains(Position::new(5, -1)));
    }

    #[test]
    fn test_area_intersects() {
        let a = Area::new(0, 0, 10, 10);
        assert!(a.intersects(&Area::new(10, 10, 20, 20)));
        assert!(a.intersects(&Area::new(-5, -5, 1, 1)));
        assert!(!a.intersects(&Area::new(11, 0, 20, 10)));
        assert!(!a.intersects(&Area::new(0, 11, 10, 20)));
    }

    #[test]
    fn test_area_nearest() {
        let area = Area::new(0, 0, 10, 10);
        assert_eq!(area.nearest(Position::new(5, 5)), Position::new(5, 5));
        assert_eq!(area.nearest(Position::new(-3, 20)), Position::new(0, 10));
        assert_eq!(area.nearest(Position::new(12, 4)), Position::new(10, 4));
    }

    #[test]
    fn test_area_around() {
        let center = Position::from_degrees(1.5, 1.5);
        let area = Area::around(center, 1_000.0);
        assert!(area.contains(center));
        assert!(area.is_valid());
        // One kilometer is about 0.009 degrees of latitude
        let (_, north) = area.max_corner().to_degrees();
        assert!((north - 1.5 - 0.009).abs() < 0.001);
    }

    #[test]
    fn test_area_rect_roundtrip() {
        let area = Area::from_degrees(0.0, 0.0, 2.0, 2.0);
        let rect: Rect<f64> = area.into();
        assert_eq!(rect.width(), 2.0);
        assert_eq!(Area::from(rect), area);
    }
}
