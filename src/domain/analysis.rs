use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cost::round2;
use super::error::{GatewayError, Result};
use super::query::TimeRange;

/// Category of an advisory recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecommendationType {
    Rightsizing,
    #[serde(rename = "RESERVED_INSTANCES")]
    ReservedInstances,
    #[serde(rename = "SPOT_INSTANCES")]
    SpotInstances,
    #[serde(rename = "STORAGE_OPTIMIZATION")]
    StorageOptimization,
    #[serde(rename = "IDLE_RESOURCES")]
    IdleResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Advisory produced by the orchestrator; surfaced verbatim after filtering.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Recommendation {
    pub id: String,

    #[serde(rename = "type")]
    pub recommendation_type: RecommendationType,

    pub resource_urn: String,

    pub current_cost: f64,

    pub projected_savings: f64,

    pub confidence: Confidence,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub action_steps: Vec<String>,
}

impl Recommendation {
    pub fn validate(&self) -> Result<()> {
        if self.current_cost < 0.0 {
            return Err(GatewayError::validation("current_cost", "must be >= 0"));
        }
        if self.projected_savings < 0.0 {
            return Err(GatewayError::validation("projected_savings", "must be >= 0"));
        }
        Ok(())
    }
}

/// Severity ordering is derived (`Low < Medium < High < Critical`) so
/// responses can sort descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Spending anomaly reported by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Anomaly {
    pub id: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub resource_urns: Vec<String>,

    pub severity: Severity,

    pub current_cost: f64,
    pub baseline_cost: f64,

    /// Signed deviation from baseline, in percent.
    pub deviation_percent: f64,

    #[serde(default)]
    pub potential_causes: Vec<String>,
}

/// One forecast sample.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub predicted_cost: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl ForecastPoint {
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.lower_bound < 0.0 || self.predicted_cost < 0.0 || self.upper_bound < 0.0 {
            return Err(GatewayError::validation(
                format!("data_points[{index}]"),
                "forecast values must be >= 0",
            ));
        }
        if !(self.lower_bound <= self.predicted_cost && self.predicted_cost <= self.upper_bound) {
            return Err(GatewayError::validation(
                format!("data_points[{index}]"),
                "bounds must satisfy lower <= predicted <= upper",
            ));
        }
        Ok(())
    }
}

/// Cost forecast over a future period.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Forecast {
    pub stack_name: String,
    pub forecast_period: TimeRange,
    pub data_points: Vec<ForecastPoint>,

    /// Confidence in [0, 1].
    pub confidence_level: f64,

    #[serde(default)]
    pub methodology: String,
}

impl Forecast {
    pub fn validate(&self) -> Result<()> {
        self.forecast_period.validate()?;
        if !(0.0..=1.0).contains(&self.confidence_level) {
            return Err(GatewayError::validation(
                "confidence_level",
                "must be within [0, 1]",
            ));
        }
        for (i, point) in self.data_points.iter().enumerate() {
            point.validate(i)?;
        }
        Ok(())
    }
}

/// Budget tracking period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl BudgetPeriod {
    /// Start of the period containing `now`.
    pub fn start_of(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let day = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        match self {
            BudgetPeriod::Daily => day,
            BudgetPeriod::Weekly => {
                day - Duration::days(now.weekday().num_days_from_monday() as i64)
            }
            BudgetPeriod::Monthly => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(day),
            BudgetPeriod::Yearly => Utc
                .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(day),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Exceeded,
}

/// One crossed alert threshold. Severity is a piecewise function of the
/// threshold value: >= 50 MEDIUM, >= 80 HIGH, >= 100 CRITICAL, else LOW.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThresholdAlert {
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
}

pub fn threshold_severity(threshold: f64) -> Severity {
    if threshold >= 100.0 {
        Severity::Critical
    } else if threshold >= 80.0 {
        Severity::High
    } else if threshold >= 50.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Budget state derived from current actual spending. All derived fields
/// come from one `Budget::derive` call; nothing is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Budget {
    pub id: String,
    pub stack_name: String,
    pub amount: f64,
    pub currency: String,
    pub period: BudgetPeriod,

    /// Ascending percentages within [0, 100].
    pub alert_thresholds: Vec<f64>,

    pub current_spending: f64,
    pub remaining: f64,

    /// Spending per elapsed day of the current period.
    pub burn_rate: f64,

    /// Estimated date the budget runs out; absent when burn rate is zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_end_date: Option<DateTime<Utc>>,

    pub status: BudgetStatus,
}

impl Budget {
    /// Validate the caller-supplied parameters before derivation.
    pub fn validate_inputs(amount: f64, thresholds: &[f64]) -> Result<()> {
        if amount <= 0.0 {
            return Err(GatewayError::validation("budget_amount", "must be > 0"));
        }
        let mut previous = f64::NEG_INFINITY;
        for (i, t) in thresholds.iter().enumerate() {
            if !(0.0..=100.0).contains(t) {
                return Err(GatewayError::validation(
                    format!("alert_thresholds[{i}]"),
                    "must be within [0, 100]",
                ));
            }
            if *t <= previous {
                return Err(GatewayError::validation(
                    "alert_thresholds",
                    "must be strictly ascending",
                ));
            }
            previous = *t;
        }
        Ok(())
    }

    /// Derive the budget record and crossed-threshold alerts from current
    /// spending. Pure; `now` is injected for testability.
    pub fn derive(
        stack_name: &str,
        amount: f64,
        currency: &str,
        period: BudgetPeriod,
        alert_thresholds: &[f64],
        current_spending: f64,
        now: DateTime<Utc>,
    ) -> Result<(Budget, Vec<ThresholdAlert>)> {
        Self::validate_inputs(amount, alert_thresholds)?;
        if current_spending < 0.0 {
            return Err(GatewayError::validation("current_spending", "must be >= 0"));
        }

        let utilization = current_spending / amount * 100.0;
        let status = if current_spending > amount {
            BudgetStatus::Exceeded
        } else if alert_thresholds
            .first()
            .is_some_and(|first| utilization >= *first && utilization < 100.0)
        {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        };

        let alerts: Vec<ThresholdAlert> = alert_thresholds
            .iter()
            .filter(|t| utilization >= **t)
            .map(|t| ThresholdAlert {
                threshold: *t,
                severity: threshold_severity(*t),
                message: format!(
                    "spending has crossed {t}% of the {period:?} budget ({utilization:.1}% used)",
                ),
            })
            .collect();

        let days_elapsed = (now - period.start_of(now)).num_days().max(1);
        let burn_rate = round2(current_spending / days_elapsed as f64);
        let remaining = round2(amount - current_spending);
        let projected_end_date = if burn_rate > 0.0 && remaining > 0.0 {
            Some(now + Duration::days((remaining / burn_rate).ceil() as i64))
        } else {
            None
        };

        Ok((
            Budget {
                id: uuid::Uuid::new_v4().to_string(),
                stack_name: stack_name.to_string(),
                amount,
                currency: currency.to_string(),
                period,
                alert_thresholds: alert_thresholds.to_vec(),
                current_spending,
                remaining,
                burn_rate,
                projected_end_date,
                status,
            },
            alerts,
        ))
    }
}

/// Two-sided cost comparison. `difference_percent` is absent (not zero, not
/// infinity) when the baseline total is zero.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CostComparison {
    pub baseline_cost: f64,
    pub target_cost: f64,
    pub difference: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference_percent: Option<f64>,

    pub currency: String,
}

impl CostComparison {
    pub fn compute(baseline: f64, target: f64, currency: &str) -> Self {
        let difference = round2(target - baseline);
        let difference_percent = if baseline == 0.0 {
            None
        } else {
            Some(round2((target - baseline) / baseline * 100.0))
        };
        Self {
            baseline_cost: baseline,
            target_cost: target,
            difference,
            difference_percent,
            currency: currency.to_string(),
        }
    }
}
