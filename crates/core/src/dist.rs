//! Geodetic distance math.
//!
//! All angles at the API boundary are degrees; internal helpers work in
//! radians on the unit sphere. Distances scale by the mean earth radius.

use crate::geometry::Point;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Unit-sphere distance (radians) between two positions, Haversine formula.
pub fn haversine_rad(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    if lat_a == lat_b && lon_a == lon_b {
        return 0.0;
    }
    let d_lat = lat_a - lat_b;
    let d_lon = lon_a - lon_b;
    let sin_lat = (d_lat / 2.0).sin();
    let sin_lon = (d_lon / 2.0).sin();
    2.0 * (sin_lat * sin_lat + sin_lon * sin_lon * lat_a.cos() * lat_b.cos())
        .sqrt()
        .asin()
}

/// Great-circle distance in meters between two lon/lat points.
pub fn distance_meters(a: Point, b: Point) -> f64 {
    EARTH_RADIUS_M
        * haversine_rad(
            a.y.to_radians(),
            a.x.to_radians(),
            b.y.to_radians(),
            b.x.to_radians(),
        )
}

/// Destination point starting at `(lat, lon)` (degrees) traveling `meters`
/// along `bearing_deg` (clockwise from north). Used to build circle rings.
pub fn destination_point(lat: f64, lon: f64, meters: f64, bearing_deg: f64) -> Point {
    let d = meters / EARTH_RADIUS_M;
    let brng = bearing_deg.to_radians();
    let lat1 = lat.to_radians();
    let lon1 = lon.to_radians();
    let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * brng.cos()).asin();
    let lon2 = lon1
        + (brng.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());
    Point::new(lon2.to_degrees(), lat2.to_degrees())
}

/// Bounding rectangle of a circle centered at `(lat, lon)` with radius
/// `meters`. Returns `(min_lat, min_lon, max_lat, max_lon)` in degrees,
/// clamped to valid coordinates.
pub fn rect_from_center(lat: f64, lon: f64, meters: f64) -> (f64, f64, f64, f64) {
    let d_lat = (meters / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().abs().max(1e-12);
    let d_lon = ((meters / EARTH_RADIUS_M).sin() / cos_lat)
        .clamp(-1.0, 1.0)
        .asin()
        .to_degrees();
    (
        (lat - d_lat).max(-90.0),
        (lon - d_lon).max(-180.0),
        (lat + d_lat).min(90.0),
        (lon + d_lon).min(180.0),
    )
}

/// Unit-sphere distance from a query point to a lat/lon rectangle, all in
/// degrees. Multiply by [`EARTH_RADIUS_M`] for meters.
pub fn point_rect_dist_geodetic_deg(
    p_lat: f64,
    p_lon: f64,
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
) -> f64 {
    point_rect_dist_geodetic_rad(
        p_lat.to_radians(),
        p_lon.to_radians(),
        min_lat.to_radians(),
        min_lon.to_radians(),
        max_lat.to_radians(),
        max_lon.to_radians(),
    )
}

// Algorithm from:
// Schubert, E., Zimek, A., & Kriegel, H.-P. (2013).
// Geodetic Distance Queries on R-Trees for Indexing Geographic Data.
// Lecture Notes in Computer Science, 146-164.
fn point_rect_dist_geodetic_rad(
    phi_q: f64,
    lam_q: f64,
    phi_l: f64,
    lam_l: f64,
    phi_h: f64,
    lam_h: f64,
) -> f64 {
    const TWO_PI: f64 = 2.0 * std::f64::consts::PI;
    const HALF_PI: f64 = std::f64::consts::FRAC_PI_2;

    // Degenerate rect: point-to-point haversine
    if phi_l >= phi_h && lam_l >= lam_h {
        return haversine_rad(phi_l, lam_l, phi_q, lam_q);
    }

    if lam_l <= lam_q && lam_q <= lam_h {
        // q is between the bounding meridians of r:
        // north, south, or within
        if phi_l <= phi_q && phi_q <= phi_h {
            return 0.0; // inside
        }
        if phi_q < phi_l {
            return phi_l - phi_q; // south
        }
        return phi_q - phi_h; // north
    }

    // pick the closer of the east/west edges
    let mut d_lam_e = lam_l - lam_q;
    let mut d_lam_w = lam_q - lam_h;
    if d_lam_e < 0.0 {
        d_lam_e += TWO_PI;
    }
    if d_lam_w < 0.0 {
        d_lam_w += TWO_PI;
    }
    let (d_lam, lam_edge) = if d_lam_e <= d_lam_w {
        (d_lam_e, lam_l)
    } else {
        (d_lam_w, lam_h)
    };

    let sin_d_lam = d_lam.sin();
    let cos_d_lam = d_lam.cos();
    let tan_phi_q = phi_q.tan();

    if d_lam >= HALF_PI {
        // more than 90 degrees away: one of the corners applies; compare
        // against the center line to pick north vs south
        let phi_mid = (phi_h + phi_l) / 2.0;
        if tan_phi_q >= phi_mid.tan() * cos_d_lam {
            return haversine_rad(phi_q, lam_q, phi_h, lam_edge);
        }
        return haversine_rad(phi_q, lam_q, phi_l, lam_edge);
    }

    if tan_phi_q >= phi_h.tan() * cos_d_lam {
        return haversine_rad(phi_q, lam_q, phi_h, lam_edge); // north corner
    }
    if tan_phi_q <= phi_l.tan() * cos_d_lam {
        return haversine_rad(phi_q, lam_q, phi_l, lam_edge); // south corner
    }

    // east or west of the rect: cross-track distance against a meridian
    (phi_q.cos() * sin_d_lam).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Paris to London is roughly 344 km
        let paris = Point::new(2.3522, 48.8566);
        let london = Point::new(-0.1276, 51.5072);
        let d = distance_meters(paris, london);
        assert!((d - 344_000.0).abs() < 5_000.0, "got {}", d);
    }

    #[test]
    fn test_distance_zero() {
        let p = Point::new(-115.0, 33.0);
        assert_eq!(distance_meters(p, p), 0.0);
    }

    #[test]
    fn test_point_inside_rect_distance_zero() {
        let d = point_rect_dist_geodetic_deg(33.0, -115.0, 30.0, -120.0, 35.0, -110.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn test_point_north_of_rect() {
        // directly north: the meridian distance in radians
        let d = point_rect_dist_geodetic_deg(40.0, -115.0, 30.0, -120.0, 35.0, -110.0);
        let expected = (40.0f64 - 35.0).to_radians();
        assert!((d - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rect_distance_lower_bound() {
        // point-to-rect distance never exceeds point-to-corner distance
        let (p_lat, p_lon) = (10.0, 50.0);
        let (min_lat, min_lon, max_lat, max_lon) = (20.0, 60.0, 25.0, 70.0);
        let d = point_rect_dist_geodetic_deg(p_lat, p_lon, min_lat, min_lon, max_lat, max_lon);
        let corner = haversine_rad(
            p_lat.to_radians(),
            p_lon.to_radians(),
            min_lat.to_radians(),
            min_lon.to_radians(),
        );
        assert!(d <= corner + 1e-12);
        assert!(d > 0.0);
    }

    #[test]
    fn test_rect_from_center_contains_circle() {
        let (min_lat, min_lon, max_lat, max_lon) = rect_from_center(33.0, -115.0, 10_000.0);
        assert!(min_lat < 33.0 && 33.0 < max_lat);
        assert!(min_lon < -115.0 && -115.0 < max_lon);
        // the north edge should be ~10km from the center
        let north = distance_meters(Point::new(-115.0, max_lat), Point::new(-115.0, 33.0));
        assert!((north - 10_000.0).abs() < 100.0, "got {}", north);
    }

    #[test]
    fn test_destination_point_round_trip() {
        let start = Point::new(-115.0, 33.0);
        let dest = destination_point(33.0, -115.0, 5_000.0, 90.0);
        let d = distance_meters(start, dest);
        assert!((d - 5_000.0).abs() < 5.0, "got {}", d);
    }
}
