// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Current conditions from the OpenWeatherMap API

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{EnrichmentSource, Fields};
use crate::config::WeatherConfig;
use crate::error::EnrichmentError;
use crate::sinks::http_client;

pub struct WeatherSource {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    location: String,
}

impl WeatherSource {
    pub fn new(config: &WeatherConfig) -> Self {
        Self {
            client: http_client(config.request_timeout_secs),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            location: config.location.clone(),
        }
    }
}

#[async_trait]
impl EnrichmentSource for WeatherSource {
    fn name(&self) -> &str {
        "weather"
    }

    async fn fetch(&self) -> Result<Fields, EnrichmentError> {
        debug!("Fetching weather for {}", self.location);
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("q", self.location.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichmentError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        parse_weather(&body)
    }
}

/// Temperature in C, description, and precipitation as rain plus snow over the last hour in mm
pub fn parse_weather(body: &Value) -> Result<Fields, EnrichmentError> {
    let temperature = body["main"]["temp"]
        .as_f64()
        .ok_or_else(|| EnrichmentError::Parse("missing main.temp".into()))?;
    let conditions = body["weather"][0]["description"]
        .as_str()
        .ok_or_else(|| EnrichmentError::Parse("missing weather description".into()))?;

    let precipitation = ["rain", "snow"]
        .iter()
        .filter_map(|kind| body[*kind]["1h"].as_f64())
        .sum::<f64>();

    let mut fields = Fields::new();
    fields.insert("temperature".into(), json!(temperature));
    fields.insert("conditions".into(), json!(conditions));
    fields.insert("precipitation".into(), json!(precipitation));
    if let Some(humidity) = body["main"]["humidity"].as_f64() {
        fields.insert("humidity".into(), json!(humidity));
    }
    if let Some(wind) = body["wind"]["speed"].as_f64() {
        fields.insert("wind_speed".into(), json!(wind));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weather_sums_rain_and_snow() {
        let body = json!({
            "weather": [{"description": "light snow"}],
            "main": {"temp": -1.5, "humidity": 88},
            "wind": {"speed": 3.1},
            "rain": {"1h": 0.25},
            "snow": {"1h": 0.5}
        });
        let fields = parse_weather(&body).unwrap();
        assert_eq!(fields["temperature"], json!(-1.5));
        assert_eq!(fields["conditions"], json!("light snow"));
        assert_eq!(fields["precipitation"], json!(0.75));
        assert_eq!(fields["humidity"], json!(88.0));
    }

    #[test]
    fn test_parse_weather_without_precipitation() {
        let body = json!({
            "weather": [{"description": "clear sky"}],
            "main": {"temp": 21.0}
        });
        let fields = parse_weather(&body).unwrap();
        assert_eq!(fields["precipitation"], json!(0.0));
        assert!(!fields.contains_key("wind_speed"));
    }

    #[test]
    fn test_parse_weather_rejects_incomplete_body() {
        let body = json!({"cod": 401, "message": "Invalid API key"});
        assert!(matches!(parse_weather(&body), Err(EnrichmentError::Parse(_))));
    }
}
