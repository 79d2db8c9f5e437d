/**
 * SENSOR MODELS - Wire payloads and normalised readings
 *
 * ROLE: Turn the device's JSON payload (current flat shape or legacy nested
 * `environment` shape) into an immutable `Reading`.
 *
 * CONTRACT: both payload shapes must keep working. Flat names win, the legacy
 * block is the fallback, anything still missing defaults to zero / "N/A".
 */

use crate::error::PayloadError;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Instant;
use time::OffsetDateTime;

/// Raw message handed from the Connection Manager to the Ingestion Loop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub received_at: OffsetDateTime,
    /// Monotonic receipt time, used by the staleness rule.
    pub received: Instant,
    pub payload: serde_json::Value,
}

impl InboundMessage {
    pub fn new(received_at: OffsetDateTime, payload: serde_json::Value) -> Self {
        Self { received_at, received: Instant::now(), payload }
    }
}

/// Sensor payload as published by the device. Every field is optional and
/// numeric fields accept both integer and float JSON numbers.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SensorPayload {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub suhu: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lembab: Option<f64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub adc_raw: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub adc_percent: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub local_aqi: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub aqi_category: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub baseline_adc: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub rssi: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub uptime: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub weather_aqi: Option<i64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub weather_temp: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub weather_aqi_cat: Option<String>,
    /// Legacy nested shape: `{"environment": {"temp": .., "humid": ..}}`.
    #[serde(default, deserialize_with = "lenient_environment")]
    pub environment: Option<LegacyEnvironment>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct LegacyEnvironment {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub temp: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humid: Option<f64>,
}

impl SensorPayload {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PayloadError> {
        if !value.is_object() {
            return Err(PayloadError::NotAnObject(json_kind(value)));
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// The feature triple fed to the classifier, plus the fields history tracks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorValues {
    pub temperature: f64,
    pub humidity: f64,
    pub aqi: i64,
}

/// Tolerant extraction: flat names first, legacy `environment` block second,
/// zero last.
pub fn extract(payload: &SensorPayload) -> SensorValues {
    let legacy = payload.environment.as_ref();
    SensorValues {
        temperature: payload
            .suhu
            .or_else(|| legacy.and_then(|env| env.temp))
            .unwrap_or(0.0),
        humidity: payload
            .lembab
            .or_else(|| legacy.and_then(|env| env.humid))
            .unwrap_or(0.0),
        aqi: payload.local_aqi.unwrap_or(0),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub aqi: Option<i64>,
    pub temperature: Option<f64>,
    pub category: Option<String>,
}

/// A normalised point-in-time reading. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub adc_raw: i64,
    pub adc_percent: i64,
    pub aqi: i64,
    pub aqi_category: String,
    pub baseline_adc: i64,
    pub ip: String,
    pub rssi: i64,
    pub uptime_secs: i64,
    pub weather: Option<WeatherSnapshot>,
}

impl Reading {
    pub fn from_payload(payload: &SensorPayload) -> Self {
        let values = extract(payload);
        let weather = if payload.weather_aqi.is_some()
            || payload.weather_temp.is_some()
            || payload.weather_aqi_cat.is_some()
        {
            Some(WeatherSnapshot {
                aqi: payload.weather_aqi,
                temperature: payload.weather_temp,
                category: payload.weather_aqi_cat.clone(),
            })
        } else {
            None
        };

        Self {
            temperature: values.temperature,
            humidity: values.humidity,
            adc_raw: payload.adc_raw.unwrap_or(0),
            adc_percent: payload.adc_percent.unwrap_or(0),
            aqi: values.aqi,
            aqi_category: payload.aqi_category.clone().unwrap_or_else(|| "N/A".into()),
            baseline_adc: payload.baseline_adc.unwrap_or(0),
            ip: payload.ip.clone().unwrap_or_else(|| "N/A".into()),
            rssi: payload.rssi.unwrap_or(0),
            uptime_secs: payload.uptime.unwrap_or(0),
            weather,
        }
    }

    pub fn values(&self) -> SensorValues {
        SensorValues {
            temperature: self.temperature,
            humidity: self.humidity,
            aqi: self.aqi,
        }
    }

    pub fn weather_aqi(&self) -> Option<i64> {
        self.weather.as_ref().and_then(|w| w.aqi)
    }

    pub fn categories(&self) -> ReadingCategories {
        ReadingCategories {
            temperature: TemperatureBand::of(self.temperature),
            humidity: HumidityBand::of(self.humidity),
            aqi: AqiBand::of(self.aqi),
            signal: SignalBand::of(self.rssi),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureBand {
    Cold,
    Normal,
    Hot,
    VeryHot,
}

impl TemperatureBand {
    pub fn of(celsius: f64) -> Self {
        if celsius < 20.0 {
            Self::Cold
        } else if celsius < 28.0 {
            Self::Normal
        } else if celsius < 35.0 {
            Self::Hot
        } else {
            Self::VeryHot
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HumidityBand {
    Dry,
    Normal,
    Humid,
}

impl HumidityBand {
    pub fn of(percent: f64) -> Self {
        if percent < 40.0 {
            Self::Dry
        } else if percent < 70.0 {
            Self::Normal
        } else {
            Self::Humid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AqiBand {
    Good,
    Moderate,
    Unhealthy,
    Poor,
    Hazardous,
}

impl AqiBand {
    pub fn of(aqi: i64) -> Self {
        match aqi {
            i64::MIN..=50 => Self::Good,
            51..=100 => Self::Moderate,
            101..=150 => Self::Unhealthy,
            151..=200 => Self::Poor,
            _ => Self::Hazardous,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalBand {
    Excellent,
    Good,
    Fair,
    Weak,
}

impl SignalBand {
    pub fn of(rssi_dbm: i64) -> Self {
        if rssi_dbm > -50 {
            Self::Excellent
        } else if rssi_dbm > -60 {
            Self::Good
        } else if rssi_dbm > -70 {
            Self::Fair
        } else {
            Self::Weak
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadingCategories {
    pub temperature: TemperatureBand,
    pub humidity: HumidityBand,
    pub aqi: AqiBand,
    pub signal: SignalBand,
}

/// Acknowledgement from the device (calibration, status, city change...),
/// kept verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceResponse {
    pub received_at: String,
    pub payload: serde_json::Value,
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// Numeric fields: any JSON number is accepted, anything else counts as missing.

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(v.and_then(|v| v.as_f64()).filter(|f| f.is_finite()))
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(v.and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
    }))
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_environment<'de, D: Deserializer<'de>>(d: D) -> Result<Option<LegacyEnvironment>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(v.filter(|v| v.is_object())
        .and_then(|v| serde_json::from_value(v).ok()))
}
