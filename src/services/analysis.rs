use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::{
    Anomaly, Budget, BudgetPeriod, Forecast, GatewayError, Recommendation, RecommendationType,
    Result, ThresholdAlert, TimeRange,
};
use crate::orchestrator::OrchestratorClient;

/// Default anomaly sensitivity, in standard deviations.
const DEFAULT_SENSITIVITY: f64 = 3.0;

/// Default forecast confidence level.
const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Analysis operations: recommendations, anomalies, forecasts, and budget
/// tracking. All cost math is delegated to the orchestrator; this layer
/// filters, orders, and derives statuses.
pub struct AnalysisService {
    orchestrator: OrchestratorClient,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetRecommendationsParams {
    pub stack_name: String,

    /// Restrict to these types; absent means all.
    #[serde(default)]
    pub recommendation_types: Option<Vec<RecommendationType>>,

    /// Drop recommendations saving less than this.
    #[serde(default)]
    pub minimum_savings: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DetectAnomaliesParams {
    pub stack_name: String,
    pub time_range: TimeRange,

    #[serde(default)]
    pub sensitivity: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ForecastParams {
    pub stack_name: String,
    pub forecast_period: TimeRange,

    #[serde(default)]
    pub confidence_level: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TrackBudgetParams {
    pub stack_name: String,
    pub budget_amount: f64,
    pub period: BudgetPeriod,

    #[serde(default)]
    pub alert_thresholds: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BudgetReport {
    #[serde(flatten)]
    pub budget: Budget,

    /// One entry per crossed threshold.
    pub alerts: Vec<ThresholdAlert>,
}

impl AnalysisService {
    pub fn new(orchestrator: OrchestratorClient) -> Self {
        Self { orchestrator }
    }

    pub async fn get_recommendations(
        &self,
        cancel: &CancellationToken,
        params: GetRecommendationsParams,
    ) -> Result<Vec<Recommendation>> {
        if let Some(minimum) = params.minimum_savings {
            if minimum < 0.0 {
                return Err(GatewayError::validation("minimum_savings", "must be >= 0"));
            }
        }

        let mut recommendations = self
            .orchestrator
            .recommendations(cancel, &params.stack_name)
            .await?;
        for recommendation in &recommendations {
            recommendation.validate()?;
        }

        if let Some(types) = &params.recommendation_types {
            recommendations.retain(|r| types.contains(&r.recommendation_type));
        }
        let minimum = params.minimum_savings.unwrap_or(0.0);
        recommendations.retain(|r| r.projected_savings >= minimum);

        // Largest savings first; ties broken by ascending id.
        recommendations.sort_by(|a, b| {
            b.projected_savings
                .partial_cmp(&a.projected_savings)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        info!(
            stack = %params.stack_name,
            count = recommendations.len(),
            "recommendations ready"
        );
        Ok(recommendations)
    }

    pub async fn detect_anomalies(
        &self,
        cancel: &CancellationToken,
        params: DetectAnomaliesParams,
    ) -> Result<Vec<Anomaly>> {
        params.time_range.validate()?;
        let sensitivity = params.sensitivity.unwrap_or(DEFAULT_SENSITIVITY);
        if sensitivity <= 0.0 {
            return Err(GatewayError::validation("sensitivity", "must be > 0"));
        }

        let mut anomalies = self
            .orchestrator
            .anomalies(cancel, &params.stack_name, &params.time_range, sensitivity)
            .await?;

        // Most severe first, most recent first within a severity.
        anomalies.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });

        info!(
            stack = %params.stack_name,
            count = anomalies.len(),
            "anomaly scan complete"
        );
        Ok(anomalies)
    }

    pub async fn forecast(
        &self,
        cancel: &CancellationToken,
        params: ForecastParams,
    ) -> Result<Forecast> {
        params.forecast_period.validate()?;
        let confidence = params.confidence_level.unwrap_or(DEFAULT_CONFIDENCE);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(GatewayError::validation(
                "confidence_level",
                "must be within [0, 1]",
            ));
        }

        let forecast = self
            .orchestrator
            .forecast(cancel, &params.stack_name, &params.forecast_period, confidence)
            .await?;
        forecast.validate()?;
        Ok(forecast)
    }

    /// Fetch the period's actual spending and derive budget status, alerts,
    /// burn rate, and the projected exhaustion date.
    pub async fn track_budget(
        &self,
        cancel: &CancellationToken,
        params: TrackBudgetParams,
    ) -> Result<BudgetReport> {
        Budget::validate_inputs(params.budget_amount, &params.alert_thresholds)?;

        let now = Utc::now();
        let period_start = params.period.start_of(now);
        let range = if now > period_start {
            TimeRange {
                start: period_start,
                end: now,
            }
        } else {
            // Exactly at the period boundary: a minimal non-empty window.
            TimeRange {
                start: period_start,
                end: period_start + chrono::Duration::seconds(1),
            }
        };

        let actual = self
            .orchestrator
            .actual_cost(cancel, &params.stack_name, &range, None)
            .await?;

        let (budget, alerts) = Budget::derive(
            &params.stack_name,
            params.budget_amount,
            &actual.currency,
            params.period,
            &params.alert_thresholds,
            actual.total_monthly,
            now,
        )?;

        info!(
            stack = %params.stack_name,
            status = ?budget.status,
            spending = budget.current_spending,
            "budget tracked"
        );
        Ok(BudgetReport { budget, alerts })
    }
}
