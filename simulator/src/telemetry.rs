use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};

pub const ICE_THICKNESS_CM: (f64, f64) = (22.0, 38.0);
pub const SURFACE_TEMPERATURE_C: (f64, f64) = (-12.0, 2.0);
pub const SNOW_ACCUMULATION_CM: (f64, f64) = (0.0, 10.0);
pub const EXTERNAL_JITTER_C: (f64, f64) = (-3.0, 3.0);

/// One synthetic ice sensor reading. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub device_id: String,
    pub location: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub ice_thickness_cm: f64,
    pub surface_temperature_c: f64,
    pub snow_accumulation_cm: f64,
    pub external_temperature_c: f64,
}

impl Telemetry {
    /// Generate a reading stamped with the current time. Ranges straddle the
    /// safe/unsafe ice thresholds so consumers see a mix of both.
    pub fn generate(rng: &mut impl Rng, device_id: &str, location: &str) -> Self {
        let ice_thickness = round2(rng.gen_range(ICE_THICKNESS_CM.0..=ICE_THICKNESS_CM.1));
        let surface =
            hundredths(rng.gen_range(SURFACE_TEMPERATURE_C.0..=SURFACE_TEMPERATURE_C.1));
        let snow_accum = round2(rng.gen_range(SNOW_ACCUMULATION_CM.0..=SNOW_ACCUMULATION_CM.1));
        // Air temperature tracks the surface, it is not sampled independently
        let jitter =
            rng.gen_range(hundredths(EXTERNAL_JITTER_C.0)..=hundredths(EXTERNAL_JITTER_C.1));

        Telemetry {
            device_id: device_id.to_string(),
            location: location.to_string(),
            timestamp: Utc::now(),
            ice_thickness_cm: ice_thickness,
            surface_temperature_c: from_hundredths(surface),
            snow_accumulation_cm: snow_accum,
            external_temperature_c: external_temperature(surface, jitter),
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn hundredths(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

fn from_hundredths(value: i64) -> f64 {
    value as f64 / 100.0
}

/// Surface plus jitter, both in hundredths. At the edges of the jitter range
/// the f64 difference to the surface can land a few ulps past the bound, so
/// the jitter is pulled in by one hundredth until it doesn't.
fn external_temperature(surface: i64, mut jitter: i64) -> f64 {
    let bound = EXTERNAL_JITTER_C.1;
    loop {
        let external = from_hundredths(surface + jitter);
        if jitter == 0 || (external - from_hundredths(surface)).abs() <= bound {
            return external;
        }
        jitter -= jitter.signum();
    }
}

fn serialize_timestamp<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
}
