//! Operator alerts, emitted as JSON log lines under the `risk_alert` target.

use crate::exchange::Outcome;
use crate::state::RiskLevel;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Types of risk alerts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum RiskAlertType {
    /// |delta| above the configured limit
    DeltaBreach { delta: Decimal, limit: Decimal },
    /// Not enough bid depth to exit the heavier side
    LiquidityShortfall {
        side: Outcome,
        depth: Decimal,
        required: Decimal,
    },
    /// Mark-to-market loss above the bailout threshold
    StopLoss { loss_pct: Decimal, limit: Decimal },
    /// Too close to settlement for new accumulation
    SettlementBuffer { seconds_left: i64, buffer: i64 },
    /// A liquidation step failed and will not be retried
    LiquidationStepFailed { step: String, error: String },
    /// An order filled but the position update could not be written
    FillNotRecorded {
        order_id: String,
        side: Outcome,
        qty: Decimal,
        price: Decimal,
        error: String,
    },
    /// A loop exhausted its restart budget
    ComponentDegraded { component: String, restarts: u32 },
}

/// A single operator alert.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub alert_type: RiskAlertType,
    pub severity: RiskLevel,
    pub message: String,
    pub metrics: HashMap<String, Decimal>,
}

impl RiskAlert {
    pub fn new(alert_type: RiskAlertType, severity: RiskLevel, message: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        let alert_id = format!(
            "risk-{}-{}",
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );

        Self {
            alert_id,
            timestamp,
            alert_type,
            severity,
            message: message.into(),
            metrics: HashMap::new(),
        }
    }

    /// Add a metric to the alert.
    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Write the alert as a structured log line for the operator.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            RiskLevel::Low => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            RiskLevel::Medium => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            RiskLevel::High | RiskLevel::Critical => {
                error!(target: "risk_alert", "RISK_ALERT: {}", json)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alert_serializes_tagged_type() {
        let alert = RiskAlert::new(
            RiskAlertType::DeltaBreach {
                delta: dec!(12),
                limit: dec!(10),
            },
            RiskLevel::Critical,
            "delta breach",
        )
        .with_metric("delta", dec!(12));

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["alert_type"]["type"], "DeltaBreach");
        assert_eq!(json["severity"], "CRITICAL");
        assert!(alert.alert_id.starts_with("risk-"));
        alert.emit();
    }
}
