//! Pure orbital and geodetic conversions.
//!
//! Everything here is stateless and deterministic. Inputs are expected to be
//! finite; callers recovering angles from orbital elements must stay inside
//! the trigonometric domains (see [`sub_satellite_latitude`], which clamps).

use serde::{Deserialize, Serialize};

/// Mean equatorial radius used for every ground computation (km).
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Standard gravitational parameter of Earth (km^3/s^2).
pub const EARTH_MU_KM3_S2: f64 = 398_600.441_8;

/// Scene units per kilometre for the display transform.
pub const SCENE_SCALE: f64 = 1.0 / EARTH_RADIUS_KM;

/// Minimum elevation used by coverage tests when the caller has no opinion.
pub const DEFAULT_MIN_ELEVATION_DEG: f64 = 10.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

pub fn deg_to_rad(deg: f64) -> f64 {
    deg * std::f64::consts::PI / 180.0
}

pub fn rad_to_deg(rad: f64) -> f64 {
    rad * 180.0 / std::f64::consts::PI
}

/// A point on the sphere, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

impl GeoPoint {
    pub fn new(lat_deg: f64, lon_deg: f64) -> Self {
        Self { lat_deg, lon_deg }
    }
}

/// Angular half-width (radians) of the footprint seen at `min_elevation_deg`
/// from a satellite at `altitude_km`.
pub fn footprint_half_angle(altitude_km: f64, min_elevation_deg: f64) -> f64 {
    let eps = deg_to_rad(min_elevation_deg);
    let ratio = EARTH_RADIUS_KM / (EARTH_RADIUS_KM + altitude_km);
    (ratio * eps.cos()).acos() - eps
}

/// Ground radius of the coverage cone (km): `R * rho`.
pub fn footprint_radius_km(altitude_km: f64, min_elevation_deg: f64) -> f64 {
    EARTH_RADIUS_KM * footprint_half_angle(altitude_km, min_elevation_deg)
}

/// Great-circle distance in km between two points (haversine).
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = deg_to_rad(a.lat_deg);
    let phi2 = deg_to_rad(b.lat_deg);
    let d_phi = deg_to_rad(b.lat_deg - a.lat_deg);
    let d_lambda = deg_to_rad(b.lon_deg - a.lon_deg);

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair above 1 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// True when `ground` lies inside the footprint of a satellite whose
/// sub-satellite point is `sub_point` at `altitude_km`.
pub fn is_covered(ground: GeoPoint, sub_point: GeoPoint, altitude_km: f64, min_elevation_deg: f64) -> bool {
    haversine_km(ground, sub_point) <= footprint_radius_km(altitude_km, min_elevation_deg)
}

/// [`is_covered`] with the default 10 degree elevation mask.
pub fn is_covered_default(ground: GeoPoint, sub_point: GeoPoint, altitude_km: f64) -> bool {
    is_covered(ground, sub_point, altitude_km, DEFAULT_MIN_ELEVATION_DEG)
}

/// Mean altitude above the spherical Earth implied by a TLE mean motion.
///
/// Returns `None` for non-positive or non-finite mean motion.
pub fn altitude_from_mean_motion(rev_per_day: f64) -> Option<f64> {
    if !rev_per_day.is_finite() || rev_per_day <= 0.0 {
        return None;
    }
    let n_rad_s = rev_per_day * 2.0 * std::f64::consts::PI / SECONDS_PER_DAY;
    let semi_major_km = (EARTH_MU_KM3_S2 / (n_rad_s * n_rad_s)).cbrt();
    Some(semi_major_km - EARTH_RADIUS_KM)
}

/// Geocentric latitude of the sub-satellite point from inclination and
/// argument of latitude (both degrees). The `asin` argument is clamped so
/// slightly corrupt element sets cannot produce NaN.
pub fn sub_satellite_latitude(inclination_deg: f64, arg_of_latitude_deg: f64) -> f64 {
    let s = deg_to_rad(inclination_deg).sin() * deg_to_rad(arg_of_latitude_deg).sin();
    rad_to_deg(s.clamp(-1.0, 1.0).asin())
}

/// Cartesian vector in the renderer's Y-up space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Map an ECI (or any right-handed, Z-up) vector in km into scene space:
/// `(x, z, -y)` scaled by [`SCENE_SCALE`]. Display only.
pub fn eci_to_scene(x_km: f64, y_km: f64, z_km: f64) -> SceneVector {
    SceneVector {
        x: x_km * SCENE_SCALE,
        y: z_km * SCENE_SCALE,
        z: -y_km * SCENE_SCALE,
    }
}
