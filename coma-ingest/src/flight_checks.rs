//! Flight checks: metadata defaulting, timing derivation and the
//! completeness gate
//!
//! The default table in [`RequiredField`] is the single source of truth for
//! missing header values. Defaulting is idempotent: a sentinel is only ever
//! written into an absent slot, so normalizing a normalized header is a
//! no-op.
//!
//! A record passes only when instrument, observatory, filter, exposure
//! midpoint, exposure duration and observation type are all real values.

use crate::models::Description;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

pub const NO_OBSERVATORY: &str = "no_observatory";
pub const NULL_STATION: &str = "NULL";
pub const NO_INSTRUMENT: &str = "no_instrument";
pub const NO_FILTER: &str = "no_filter";

/// Format of the derived mid-exposure timestamp
pub const ISO_DATE_MID_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Format of the archive (date-only) field
pub const ARCHIVE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Header fields that are always present after normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequiredField {
    Observatory,
    StationCode,
    Instrument,
    MjdMid,
    ExposureTime,
    Filter,
}

impl RequiredField {
    pub const ALL: [RequiredField; 6] = [
        RequiredField::Observatory,
        RequiredField::StationCode,
        RequiredField::Instrument,
        RequiredField::MjdMid,
        RequiredField::ExposureTime,
        RequiredField::Filter,
    ];

    /// Header key as written by the describe job
    pub fn header_key(self) -> &'static str {
        match self {
            RequiredField::Observatory => "OBSERVATORY",
            RequiredField::StationCode => "OBSCODE",
            RequiredField::Instrument => "INSTRUMENT",
            RequiredField::MjdMid => "MJD-MID",
            RequiredField::ExposureTime => "EXPTIME",
            RequiredField::Filter => "FILTER",
        }
    }

    fn is_absent(self, header: &Description) -> bool {
        match self {
            RequiredField::Observatory => header.observatory.is_none(),
            RequiredField::StationCode => header.obscode.is_none(),
            RequiredField::Instrument => header.instrument.is_none(),
            RequiredField::MjdMid => header.mjd_mid.is_none(),
            RequiredField::ExposureTime => header.exptime.is_none(),
            RequiredField::Filter => header.filter.is_none(),
        }
    }

    /// Fill the slot with the documented default if, and only if, it is absent
    fn fill_default(self, header: &mut Description) -> bool {
        if !self.is_absent(header) {
            return false;
        }
        match self {
            RequiredField::Observatory => header.observatory = Some(NO_OBSERVATORY.to_string()),
            RequiredField::StationCode => header.obscode = Some(NULL_STATION.to_string()),
            RequiredField::Instrument => header.instrument = Some(NO_INSTRUMENT.to_string()),
            RequiredField::MjdMid => header.mjd_mid = Some(0.0),
            RequiredField::ExposureTime => header.exptime = Some(0.0),
            RequiredField::Filter => header.filter = Some(NO_FILTER.to_string()),
        }
        true
    }

    fn holds_sentinel(self, header: &Description) -> bool {
        match self {
            RequiredField::Observatory => header.observatory.as_deref() == Some(NO_OBSERVATORY),
            RequiredField::StationCode => header.obscode.as_deref() == Some(NULL_STATION),
            RequiredField::Instrument => header.instrument.as_deref() == Some(NO_INSTRUMENT),
            RequiredField::MjdMid => header.mjd_mid == Some(0.0),
            RequiredField::ExposureTime => header.exptime == Some(0.0),
            RequiredField::Filter => header.filter.as_deref() == Some(NO_FILTER),
        }
    }
}

/// Observation type derived from the raw type code and reduction flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Reduced,
    Raw,
    Bias,
    Dark,
    Flat,
    NoType,
}

impl ObservationType {
    pub fn classify(type_code: Option<&str>, reduced: Option<bool>) -> Self {
        let code = type_code.map(|c| c.trim().to_ascii_uppercase());
        match code.as_deref() {
            Some("OBJECT") if reduced == Some(true) => ObservationType::Reduced,
            Some("OBJECT") => ObservationType::Raw,
            Some("BIAS") => ObservationType::Bias,
            Some("DARK") => ObservationType::Dark,
            Some("FLAT") => ObservationType::Flat,
            _ => ObservationType::NoType,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObservationType::Reduced => "reduced",
            ObservationType::Raw => "raw",
            ObservationType::Bias => "bias",
            ObservationType::Dark => "dark",
            ObservationType::Flat => "flat",
            ObservationType::NoType => "no_type",
        }
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing fields derived from a real exposure midpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureTiming {
    /// Mid-exposure timestamp (UTC)
    pub mid: NaiveDateTime,
    /// Date-only field used for the archive layout
    pub archive_date: NaiveDate,
    /// Exposure window start (equal to `mid`)
    pub start: NaiveDateTime,
    /// Exposure window end (`start` plus the configured offset)
    pub end: NaiveDateTime,
}

impl ExposureTiming {
    pub fn archive_date_string(&self) -> String {
        self.archive_date.format(ARCHIVE_DATE_FORMAT).to_string()
    }
}

/// Reason a record fails the completeness gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightCheckFailure {
    MissingInstrument,
    MissingObservatory,
    MissingMidpoint,
    /// Midpoint present but outside the representable calendar
    InvalidMidpoint,
    /// Exposure duration zero (or negative)
    ZeroExposure,
    MissingFilter,
    UnknownObservationType,
}

impl fmt::Display for FlightCheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FlightCheckFailure::MissingInstrument => "instrument missing",
            FlightCheckFailure::MissingObservatory => "observatory missing",
            FlightCheckFailure::MissingMidpoint => "exposure midpoint missing",
            FlightCheckFailure::InvalidMidpoint => "exposure midpoint out of range",
            FlightCheckFailure::ZeroExposure => "exposure duration is zero",
            FlightCheckFailure::MissingFilter => "filter missing",
            FlightCheckFailure::UnknownObservationType => "observation type unknown",
        };
        f.write_str(text)
    }
}

/// Gate outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(Vec<FlightCheckFailure>),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Header after defaulting, with derived fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedObservation {
    /// Header with every [`RequiredField`] filled
    pub header: Description,
    pub observation_type: ObservationType,
    /// Mid-exposure timestamp, or the epoch sentinel when the midpoint is zero
    pub iso_date_mid: String,
    /// Present only for a real (non-zero, representable) midpoint
    pub timing: Option<ExposureTiming>,
}

impl NormalizedObservation {
    pub fn observatory(&self) -> &str {
        self.header.observatory.as_deref().unwrap_or(NO_OBSERVATORY)
    }

    pub fn station_code(&self) -> &str {
        self.header.obscode.as_deref().unwrap_or(NULL_STATION)
    }

    pub fn instrument(&self) -> &str {
        self.header.instrument.as_deref().unwrap_or(NO_INSTRUMENT)
    }

    pub fn mjd_mid(&self) -> f64 {
        self.header.mjd_mid.unwrap_or(0.0)
    }

    pub fn exposure_time(&self) -> f64 {
        self.header.exptime.unwrap_or(0.0)
    }

    pub fn filter(&self) -> &str {
        self.header.filter.as_deref().unwrap_or(NO_FILTER)
    }

    /// Required fields currently holding their default sentinel
    pub fn defaulted_fields(&self) -> Vec<RequiredField> {
        RequiredField::ALL
            .into_iter()
            .filter(|field| field.holds_sentinel(&self.header))
            .collect()
    }
}

/// Normalized observation that passed the gate
///
/// Only constructible through [`FlightChecks::gate`], so downstream stages
/// can rely on real timing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedObservation {
    pub normalized: NormalizedObservation,
    pub timing: ExposureTiming,
}

/// Flight check runner
#[derive(Debug, Clone)]
pub struct FlightChecks {
    exposure_window: Duration,
}

impl FlightChecks {
    /// `exposure_window_secs` is the offset between exposure start and end
    pub fn new(exposure_window_secs: u64) -> Self {
        // Capped at one day; anything longer is a configuration mistake
        let secs = exposure_window_secs.min(86_400) as i64;
        Self {
            exposure_window: Duration::seconds(secs),
        }
    }

    /// Apply defaults, derive timing, classify and evaluate the gate
    pub fn normalize(&self, description: &Description) -> (NormalizedObservation, Verdict) {
        let mut header = description.clone();

        for field in RequiredField::ALL {
            if field.fill_default(&mut header) {
                info!(
                    field = field.header_key(),
                    "Header value missing, applied default"
                );
            }
        }

        let mjd_mid = header.mjd_mid.unwrap_or(0.0);
        let (iso_date_mid, timing) = if mjd_mid == 0.0 {
            (epoch_sentinel().format(ISO_DATE_MID_FORMAT).to_string(), None)
        } else {
            match mjd_to_datetime(mjd_mid) {
                Some(mid) => {
                    let timing = mid
                        .checked_add_signed(self.exposure_window)
                        .map(|end| ExposureTiming {
                            mid,
                            archive_date: mid.date(),
                            start: mid,
                            end,
                        });
                    (mid.format(ISO_DATE_MID_FORMAT).to_string(), timing)
                }
                None => (epoch_sentinel().format(ISO_DATE_MID_FORMAT).to_string(), None),
            }
        };

        let observation_type =
            ObservationType::classify(header.image_type.as_deref(), header.reduced);

        let normalized = NormalizedObservation {
            header,
            observation_type,
            iso_date_mid,
            timing,
        };

        let verdict = evaluate(&normalized);
        debug!(verdict = ?verdict, observation_type = %observation_type, "Flight checks evaluated");

        (normalized, verdict)
    }

    /// Convert a passing normalization into a [`ValidatedObservation`]
    pub fn gate(
        normalized: NormalizedObservation,
        verdict: Verdict,
    ) -> Result<ValidatedObservation, Vec<FlightCheckFailure>> {
        match verdict {
            Verdict::Fail(failures) => Err(failures),
            Verdict::Pass => match normalized.timing.clone() {
                Some(timing) => Ok(ValidatedObservation { normalized, timing }),
                None => Err(vec![FlightCheckFailure::InvalidMidpoint]),
            },
        }
    }
}

impl Default for FlightChecks {
    fn default() -> Self {
        Self::new(60)
    }
}

fn evaluate(normalized: &NormalizedObservation) -> Verdict {
    let mut failures = Vec::new();

    if normalized.instrument() == NO_INSTRUMENT {
        failures.push(FlightCheckFailure::MissingInstrument);
    }
    if normalized.observatory() == NO_OBSERVATORY {
        failures.push(FlightCheckFailure::MissingObservatory);
    }
    if normalized.mjd_mid() == 0.0 {
        failures.push(FlightCheckFailure::MissingMidpoint);
    } else if normalized.timing.is_none() {
        failures.push(FlightCheckFailure::InvalidMidpoint);
    }
    if normalized.exposure_time() <= 0.0 {
        failures.push(FlightCheckFailure::ZeroExposure);
    }
    if normalized.filter() == NO_FILTER {
        failures.push(FlightCheckFailure::MissingFilter);
    }
    if normalized.observation_type == ObservationType::NoType {
        failures.push(FlightCheckFailure::UnknownObservationType);
    }

    if failures.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Fail(failures)
    }
}

/// Timestamp used when the exposure midpoint is the zero sentinel
pub fn epoch_sentinel() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Convert a Modified Julian Date (UTC) to a calendar timestamp
///
/// MJD 0 is 1858-11-17T00:00:00. Returns `None` for non-finite or
/// unrepresentable values.
pub fn mjd_to_datetime(mjd: f64) -> Option<NaiveDateTime> {
    // ~27,000 years either side of the epoch
    if !mjd.is_finite() || mjd.abs() > 1.0e7 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1858, 11, 17)?.and_hms_opt(0, 0, 0)?;
    let millis = (mjd * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}
