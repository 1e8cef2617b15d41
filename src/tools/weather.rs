//! Weather 工具：wttr.in JSON 接口
//!
//! 先规范化城市名（去首尾空白、合并空格、只允许字母与常见分隔符），
//! 无法识别的地点（HTTP 404、非 JSON、缺少 current_condition）一律返回错误，不返回残缺数据。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{Tool, ToolSpec};

pub const WTTR_BASE_URL: &str = "https://wttr.in";

const MAX_CITY_CHARS: usize = 85;

/// 规范化城市名；不合法时返回错误描述
pub fn normalize_city(input: &str) -> Result<String, String> {
    let city = input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == ',' || c == '.' || c == '-')
        .trim()
        .to_string();
    if city.is_empty() {
        return Err("City name is empty".to_string());
    }
    if city.chars().count() > MAX_CITY_CHARS {
        return Err(format!("Unrecognized location '{city}'"));
    }
    let valid = city
        .chars()
        .all(|c| c.is_alphabetic() || matches!(c, ' ' | '-' | '\'' | '.' | ','));
    if !valid || !city.chars().any(char::is_alphabetic) {
        return Err(format!("Unrecognized location '{city}'"));
    }
    Ok(city)
}

fn field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("?")
}

/// wttr.in 的嵌套形式 `[{"value": "..."}]`
fn nested_value<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)?.as_array()?.first()?.get("value")?.as_str()
}

/// 把 wttr.in j1 响应格式化为报告；缺少 current_condition 视为未识别地点
pub fn format_report(city: &str, body: &Value) -> Result<String, String> {
    let current = body
        .get("current_condition")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or_else(|| format!("Unrecognized location '{city}'"))?;
    let area = body
        .get("nearest_area")
        .and_then(Value::as_array)
        .and_then(|a| a.first());
    let resolved = match area {
        Some(a) => {
            let name = nested_value(a, "areaName").unwrap_or(city);
            match nested_value(a, "country") {
                Some(country) => format!("{name}, {country}"),
                None => name.to_string(),
            }
        }
        None => city.to_string(),
    };
    let condition = nested_value(current, "weatherDesc").unwrap_or("?");
    Ok(format!(
        "Weather in {resolved}:\n\
         Temperature: {}°C ({}°F)\n\
         Condition: {condition}\n\
         Humidity: {}%\n\
         Wind: {} km/h ({} mph)\n\
         Feels like: {}°C ({}°F)",
        field(current, "temp_C"),
        field(current, "temp_F"),
        field(current, "humidity"),
        field(current, "windspeedKmph"),
        field(current, "windspeedMiles"),
        field(current, "FeelsLikeC"),
        field(current, "FeelsLikeF"),
    ))
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WeatherArgs {
    /// City name (e.g., 'London', 'New York', 'Tokyo')
    city: String,
}

pub struct WeatherTool {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl WeatherTool {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agentforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn url_for(&self, city: &str) -> Result<Url, String> {
        let mut url = Url::parse(&self.base_url).map_err(|e| format!("Invalid weather endpoint: {e}"))?;
        url.path_segments_mut()
            .map_err(|_| "Invalid weather endpoint".to_string())?
            .pop_if_empty()
            .push(city);
        url.query_pairs_mut().append_pair("format", "j1");
        Ok(url)
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::from_args::<WeatherArgs>(
            "get_weather",
            "Get current weather information for any city in the world. \
             Returns temperature, conditions, humidity, and wind speed.",
        )
        .unwrap_or_else(|_| ToolSpec::new("get_weather", "Get current weather for a city."))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: WeatherArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let city = normalize_city(&args.city)?;
        let url = self.url_for(&city)?;
        tracing::info!(city = %city, "weather tool lookup");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Weather service unreachable for '{city}': {e}"))?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(format!("Unrecognized location '{city}'")),
            s => return Err(format!("Weather service returned HTTP {s} for '{city}'")),
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|_| format!("Unrecognized location '{city}'"))?;
        format_report(&city, &body)
    }
}
