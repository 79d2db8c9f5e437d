//! Alert Evaluator: pure threshold rules over a single reading.

use crate::config::AlertThresholds;
use crate::models::Reading;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Danger,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
}

impl Alert {
    fn new(severity: Severity, message: String) -> Self {
        Self { severity, message }
    }
}

/// Evaluates with the stock thresholds.
pub fn evaluate(reading: &Reading) -> Vec<Alert> {
    evaluate_with(reading, &AlertThresholds::default())
}

/// Every rule fires independently; the result is in rule order:
/// local AQI, weather AQI, temperature, humidity.
pub fn evaluate_with(reading: &Reading, limits: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if reading.aqi > limits.aqi_danger {
        alerts.push(Alert::new(
            Severity::Danger,
            format!("AQI {} is hazardous, avoid outdoor activity", reading.aqi),
        ));
    } else if reading.aqi > limits.aqi_warning {
        alerts.push(Alert::new(
            Severity::Warning,
            format!("AQI {} is unhealthy for sensitive groups", reading.aqi),
        ));
    }

    if let Some(weather_aqi) = reading.weather_aqi() {
        if weather_aqi > limits.weather_aqi_info {
            alerts.push(Alert::new(
                Severity::Info,
                format!("Outdoor AQI from weather service is {weather_aqi}"),
            ));
        }
    }

    if reading.temperature > limits.temperature_high {
        alerts.push(Alert::new(
            Severity::Warning,
            format!("High temperature: {:.1}°C", reading.temperature),
        ));
    }

    if reading.humidity > limits.humidity_high {
        alerts.push(Alert::new(
            Severity::Warning,
            format!("High humidity: {:.0}%", reading.humidity),
        ));
    } else if reading.humidity < limits.humidity_low {
        alerts.push(Alert::new(
            Severity::Warning,
            format!("Low humidity: {:.0}%", reading.humidity),
        ));
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorPayload;
    use serde_json::json;

    fn reading(v: serde_json::Value) -> Reading {
        Reading::from_payload(&SensorPayload::from_value(&v).unwrap())
    }

    fn severities(alerts: &[Alert]) -> Vec<Severity> {
        alerts.iter().map(|a| a.severity).collect()
    }

    #[test]
    fn test_bad_air_hot_and_humid_yields_three_alerts_in_order() {
        let alerts = evaluate(&reading(json!({"local_aqi": 250, "suhu": 36, "lembab": 85})));
        assert_eq!(
            severities(&alerts),
            vec![Severity::Danger, Severity::Warning, Severity::Warning]
        );
        assert!(alerts[0].message.contains("AQI 250"));
        assert!(alerts[1].message.contains("temperature"));
        assert!(alerts[2].message.contains("humidity"));
    }

    #[test]
    fn test_comfortable_reading_has_no_alerts() {
        assert!(evaluate(&reading(json!({"local_aqi": 40, "suhu": 22, "lembab": 50}))).is_empty());
    }

    #[test]
    fn test_aqi_warning_band_is_half_open() {
        let at = |aqi: i64| severities(&evaluate(&reading(json!({"local_aqi": aqi, "suhu": 25, "lembab": 50}))));
        assert!(at(100).is_empty());
        assert_eq!(at(101), vec![Severity::Warning]);
        assert_eq!(at(200), vec![Severity::Warning]);
        assert_eq!(at(201), vec![Severity::Danger]);
    }

    #[test]
    fn test_weather_aqi_is_informational_and_ordered_after_local() {
        let alerts = evaluate(&reading(json!({
            "local_aqi": 150, "suhu": 25, "lembab": 20, "weather_aqi": 180
        })));
        assert_eq!(
            severities(&alerts),
            vec![Severity::Warning, Severity::Info, Severity::Warning]
        );
        assert!(alerts[2].message.starts_with("Low humidity"));
    }

    #[test]
    fn test_custom_thresholds() {
        let limits = AlertThresholds { temperature_high: 30.0, ..AlertThresholds::default() };
        let r = reading(json!({"local_aqi": 10, "suhu": 31, "lembab": 50}));
        assert!(evaluate(&r).is_empty());
        assert_eq!(severities(&evaluate_with(&r, &limits)), vec![Severity::Warning]);
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        // humidity 0 is below the low threshold
        let alerts = evaluate(&reading(json!({})));
        assert_eq!(severities(&alerts), vec![Severity::Warning]);
    }
}
