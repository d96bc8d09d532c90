//! Current time tool.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{Value, json};

use crate::error::Result;
use crate::tool::{ParamExt, ParameterValidationError, Tool, ToolContext, ToolResult};

/// Tool that reports the current date and time.
#[derive(Debug, Clone, Default)]
pub struct CurrentTimeTool;

impl CurrentTimeTool {
    /// Create the tool.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally shift to a UTC offset in hours."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "offset_hours": {
                    "type": "integer",
                    "description": "Hours from UTC, e.g. -5 or 9. Defaults to 0.",
                    "minimum": -12,
                    "maximum": 14
                }
            }
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let hours = params.optional_i64("offset_hours", 0);
        if !(-12..=14).contains(&hours) {
            return Err(ParameterValidationError::out_of_range(
                "offset_hours",
                hours,
                "must be between -12 and 14",
            )
            .into());
        }

        let offset = FixedOffset::east_opt((hours * 3600) as i32).ok_or_else(|| {
            ParameterValidationError::out_of_range("offset_hours", hours, "invalid offset")
        })?;
        let now = Utc::now().with_timezone(&offset);

        Ok(ToolResult::text(now.to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use chrono::DateTime;

    #[tokio::test]
    async fn test_utc_by_default() {
        let result = CurrentTimeTool::new()
            .execute(json!({}), &ToolContext::default())
            .await
            .unwrap();
        let parsed = DateTime::parse_from_rfc3339(&result.to_llm_content()).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }

    #[tokio::test]
    async fn test_offset_applied() {
        let result = CurrentTimeTool::new()
            .execute(json!({"offset_hours": -5}), &ToolContext::default())
            .await
            .unwrap();
        let content = result.to_llm_content();
        assert!(content.ends_with("-05:00"));
        assert!(DateTime::parse_from_rfc3339(&content).is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_offset() {
        let err = CurrentTimeTool::new()
            .execute(json!({"offset_hours": 20}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidToolParams(_)));
    }
}
