//! Geohash encoding and bounding-box decoding (standard base-32 alphabet).

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Encode `(lat, lon)` into a geohash of `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let precision = precision.clamp(1, 22);
    let mut out = String::with_capacity(precision);
    let (mut lat_lo, mut lat_hi) = (-90.0f64, 90.0f64);
    let (mut lon_lo, mut lon_hi) = (-180.0f64, 180.0f64);
    let mut even = true;
    let mut bit = 0u8;
    let mut ch = 0usize;
    while out.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                ch = (ch << 1) | 1;
                lon_lo = mid;
            } else {
                ch <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                ch = (ch << 1) | 1;
                lat_lo = mid;
            } else {
                ch <<= 1;
                lat_hi = mid;
            }
        }
        even = !even;
        bit += 1;
        if bit == 5 {
            out.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }
    out
}

/// The bounding box a geohash denotes: `(min_lat, min_lon, max_lat, max_lon)`.
/// Unknown characters resolve as bit value zero, mirroring lenient decoders.
pub fn bounding_box(hash: &str) -> (f64, f64, f64, f64) {
    let (mut lat_lo, mut lat_hi) = (-90.0f64, 90.0f64);
    let (mut lon_lo, mut lon_hi) = (-180.0f64, 180.0f64);
    let mut even = true;
    for c in hash.bytes() {
        let cd = BASE32
            .iter()
            .position(|&b| b == c.to_ascii_lowercase())
            .unwrap_or(0);
        for shift in (0..5).rev() {
            let bit = (cd >> shift) & 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit == 1 {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit == 1 {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }
    (lat_lo, lon_lo, lat_hi, lon_hi)
}
