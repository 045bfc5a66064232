//! Web-mercator tile and quadkey conversions.

use crate::error::{Error, Result};
use std::f64::consts::PI;

/// Bounds of the XYZ tile `(x, y, z)`: `(min_lat, min_lon, max_lat, max_lon)`.
pub fn tile_to_bounds(x: i64, y: i64, z: u64) -> (f64, f64, f64, f64) {
    let n = 2f64.powi(z.min(38) as i32);
    let lon_of = |x: f64| x / n * 360.0 - 180.0;
    let lat_of = |y: f64| {
        let t = PI * (1.0 - 2.0 * y / n);
        t.sinh().atan().to_degrees()
    };
    let min_lon = lon_of(x as f64);
    let max_lon = lon_of(x as f64 + 1.0);
    let max_lat = lat_of(y as f64);
    let min_lat = lat_of(y as f64 + 1.0);
    (min_lat, min_lon, max_lat, max_lon)
}

/// Parse a Bing-style quadkey into tile coordinates.
pub fn quadkey_to_tile(key: &str) -> Result<(i64, i64, u64)> {
    let z = key.len() as u64;
    let (mut x, mut y) = (0i64, 0i64);
    for (i, c) in key.chars().enumerate() {
        let mask = 1i64 << (key.len() - i - 1);
        match c {
            '0' => {}
            '1' => x |= mask,
            '2' => y |= mask,
            '3' => {
                x |= mask;
                y |= mask;
            }
            _ => return Err(Error::invalid_argument(key)),
        }
    }
    Ok((x, y, z))
}

/// Bounds of a quadkey: `(min_lat, min_lon, max_lat, max_lon)`.
pub fn quadkey_to_bounds(key: &str) -> Result<(f64, f64, f64, f64)> {
    let (x, y, z) = quadkey_to_tile(key)?;
    Ok(tile_to_bounds(x, y, z))
}
