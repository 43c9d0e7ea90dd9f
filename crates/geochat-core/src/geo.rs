//! # Distance Math
//!
//! Flat-earth distance between two coordinates. The Euclidean norm of the
//! degree difference is scaled by a fixed meters-per-degree factor. This is
//! not geodesic; it is only meant for the short proximity radii the protocol
//! gates on, and peers on the network all compute it the same way.

use crate::types::Coordinate;

/// Approximate meters in one degree of arc
pub const METERS_PER_DEGREE: f64 = 111_139.0;

/// Distance in meters between `a` and `b`
pub fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let d_lat = a.latitude - b.latitude;
    let d_lon = a.longitude - b.longitude;
    d_lat.hypot(d_lon) * METERS_PER_DEGREE
}

/// Whether `b` lies within `radius_m` meters of `a` (inclusive)
pub fn within(a: &Coordinate, b: &Coordinate, radius_m: f64) -> bool {
    distance(a, b) <= radius_m
}
