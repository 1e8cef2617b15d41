//! 当前日期时间工具（本地时区）

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use serde_json::Value;

use crate::tools::{Tool, ToolSpec};

pub fn format_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "Current date and time:\n\
         Date: {}\n\
         Day: {}\n\
         Time: {}\n\
         ISO week: {}\n\
         Timestamp: {}",
        now.format("%B %d, %Y"),
        now.format("%A"),
        now.format("%I:%M:%S %p"),
        now.format("%V of %G"),
        now.to_rfc3339(),
    )
}

pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "get_current_datetime",
            "Get the current date and time. Use this when the user asks about today's date, \
             the current time, or the day of the week.",
        )
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        Ok(format_datetime(&Local::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_format_fixed_instant() {
        let t = Utc.with_ymd_and_hms(2024, 3, 15, 14, 5, 9).unwrap();
        let s = format_datetime(&t);
        assert!(s.contains("Date: March 15, 2024"));
        assert!(s.contains("Day: Friday"));
        assert!(s.contains("Time: 02:05:09 PM"));
        assert!(s.contains("ISO week: 11 of 2024"));
        assert!(s.contains("Timestamp: 2024-03-15T14:05:09+00:00"));
    }

    #[test]
    fn test_iso_week_crosses_year_boundary() {
        // 2021-01-01 是周五，属于 2020 年的第 53 个 ISO 周
        let t = Utc.with_ymd_and_hms(2021, 1, 1, 9, 0, 0).unwrap();
        assert!(format_datetime(&t).contains("ISO week: 53 of 2020"));
        // 2024-12-30 是周一，属于 2025 年第 1 周
        let t = Utc.with_ymd_and_hms(2024, 12, 30, 9, 0, 0).unwrap();
        assert!(format_datetime(&t).contains("ISO week: 01 of 2025"));
    }

    #[tokio::test]
    async fn test_tool_has_no_params() {
        let tool = DateTimeTool;
        assert!(tool.spec().parameters.is_empty());
        assert!(tool.execute(Value::Null).await.is_ok());
    }
}
