//! Header-derived observation description
//!
//! Field set returned by the describe job under `result.PARAMETERS`.
//! Header producers are inconsistent about JSON types, so numeric values are
//! accepted as numbers or numeric strings and the reduction flag as a
//! boolean, `T`/`F`, `true`/`false` or `1`/`0`. Values that cannot be
//! interpreted are treated as absent.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Raw observation header values
///
/// Every field is optional: absence is resolved by the flight checks, never
/// here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    #[serde(rename = "OBSERVATORY", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub observatory: Option<String>,

    /// Observer/station code
    #[serde(rename = "OBSCODE", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub obscode: Option<String>,

    #[serde(rename = "INSTRUMENT", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,

    /// Exposure midpoint (MJD, UTC)
    #[serde(rename = "MJD-MID", default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub mjd_mid: Option<f64>,

    /// Exposure duration in seconds
    #[serde(rename = "EXPTIME", default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub exptime: Option<f64>,

    #[serde(rename = "FILTER", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Raw observation type code (OBJECT, BIAS, DARK, FLAT, ...)
    #[serde(rename = "IMAGETYP", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,

    #[serde(rename = "REDUCED", default, deserialize_with = "lenient_flag", skip_serializing_if = "Option::is_none")]
    pub reduced: Option<bool>,

    /// Object name exactly as written by the observer
    #[serde(rename = "ORIGINAL-OBJECT-RAW", default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub raw_object: Option<String>,

    #[serde(rename = "RA-J2000-APPROX", default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ra: Option<f64>,

    #[serde(rename = "DEC-J2000-APPROX", default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub dec: Option<f64>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(parsed.filter(|v| v.is_finite()))
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0),
        Some(Value::String(s)) => match s.trim().to_ascii_uppercase().as_str() {
            "T" | "TRUE" | "Y" | "YES" | "1" => Some(true),
            "F" | "FALSE" | "N" | "NO" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}
