//! Signal-strength based distance estimation
//!
//! Log-distance path-loss approximation calibrated against a reference
//! reading taken at one metre. Results are rough: walls, bodies and antenna
//! orientation easily move a reading by several metres.

/// Calibrated signal strength at one metre, in dBm
pub const DEFAULT_REFERENCE_RSSI: i16 = -59;

/// Estimate the distance in metres for a measured `rssi`.
///
/// Readings of 0 dBm or above are not physical for this radio class and are
/// clamped to -1 dBm, which maps to a few centimetres.
pub fn estimate_distance(rssi: i16, reference_rssi: i16) -> f64 {
    let measured = f64::from(rssi.min(-1));
    let reference = f64::from(reference_rssi.min(-1));

    let ratio = measured / reference;
    if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976 * ratio.powf(7.7095) + 0.111
    }
}
