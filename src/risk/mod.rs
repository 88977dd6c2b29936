//! Risk Aggregator
//!
//! Deterministic weighted combination of specialist sub-scores.
//! The full weight table is always summed: a category whose task is absent,
//! still running or unsuccessful contributes zero instead of being dropped,
//! so partial and complete snapshots are on the same scale.

use crate::config::RiskWeights;
use crate::error::InvestigationError;
use crate::models::{
    AggregateRisk, CategoryScore, ConfidenceLevel, Recommendation, RiskCategory, SpecialistTask,
    TaskStatus,
};
use crate::Result;
use tracing::debug;

pub const WEIGHT_TOLERANCE: f64 = 1e-6;

pub const FILE_THRESHOLD: f64 = 75.0;
pub const MONITOR_THRESHOLD: f64 = 40.0;

pub const MEDIUM_CONFIDENCE: f64 = 0.5;
pub const HIGH_CONFIDENCE: f64 = 0.9;

/// Validated category weight table
#[derive(Debug, Clone)]
pub struct RiskModel {
    weights: Vec<(RiskCategory, f64)>,
}

impl RiskModel {
    /// Rejects negative or duplicate weights and tables not summing to 1.0
    pub fn new(weights: RiskWeights) -> Result<Self> {
        let weights = weights.0;

        for (i, (category, weight)) in weights.iter().enumerate() {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(InvestigationError::ConfigError(format!(
                    "weight for {:?} must be a non-negative number, got {}",
                    category, weight
                )));
            }
            if weights[..i].iter().any(|(c, _)| c == category) {
                return Err(InvestigationError::ConfigError(format!(
                    "category {:?} listed twice",
                    category
                )));
            }
        }

        let model = Self { weights };
        let total = model.weight_sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(InvestigationError::ConfigError(format!(
                "category weights must sum to 1.0, got {}",
                total
            )));
        }

        Ok(model)
    }

    /// Skips validation so tests can exercise drift detection
    #[cfg(test)]
    pub(crate) fn unchecked(weights: Vec<(RiskCategory, f64)>) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &[(RiskCategory, f64)] {
        &self.weights
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().map(|(_, w)| w).sum()
    }
}

impl Default for RiskModel {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default().0,
        }
    }
}

/// Map an overall score onto a filing recommendation
pub fn recommend(overall: f64) -> Recommendation {
    if overall >= FILE_THRESHOLD {
        Recommendation::File
    } else if overall >= MONITOR_THRESHOLD {
        Recommendation::Monitor
    } else {
        Recommendation::Clear
    }
}

pub fn confidence_level(confidence: f64) -> ConfidenceLevel {
    if confidence >= HIGH_CONFIDENCE {
        ConfidenceLevel::High
    } else if confidence >= MEDIUM_CONFIDENCE {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    }
}

pub struct RiskAggregator {
    model: RiskModel,
}

impl RiskAggregator {
    pub fn new(model: RiskModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &RiskModel {
        &self.model
    }

    /// Snapshot of the current task states.
    ///
    /// Provisional keys on success, not termination: a session whose tasks
    /// all ended with one timed out stays provisional below High confidence.
    pub fn recompute(&self, tasks: &[SpecialistTask]) -> Result<AggregateRisk> {
        let mut risk = self.compute(tasks)?;
        let all_succeeded =
            risk.dispatched > 0 && risk.succeeded == risk.dispatched;
        risk.provisional = !(risk.confidence_level == ConfidenceLevel::High || all_succeeded);
        Ok(risk)
    }

    /// Snapshot for a session forced to close early
    pub fn recompute_aborted(&self, tasks: &[SpecialistTask]) -> Result<AggregateRisk> {
        let mut risk = self.compute(tasks)?;
        risk.provisional = risk.confidence_level != ConfidenceLevel::High;
        Ok(risk)
    }

    fn compute(&self, tasks: &[SpecialistTask]) -> Result<AggregateRisk> {
        let total_weight = self.model.weight_sum();
        if (total_weight - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(InvestigationError::AggregationError(format!(
                "weight table drifted to {}",
                total_weight
            )));
        }

        let mut categories = Vec::with_capacity(self.model.weights.len());
        let mut overall = 0.0;

        for (category, weight) in &self.model.weights {
            let kind = category.specialist();

            // latest dispatch of the kind wins
            let task = tasks
                .iter()
                .filter(|t| t.kind == kind)
                .max_by_key(|t| t.dispatched_at);

            let score = match task {
                Some(t) if t.status == TaskStatus::Succeeded => {
                    let score = t.risk_score.ok_or_else(|| {
                        InvestigationError::AggregationError(format!(
                            "task {} succeeded without a risk score",
                            t.task_id
                        ))
                    })?;
                    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                        return Err(InvestigationError::AggregationError(format!(
                            "task {} has out-of-range score {}",
                            t.task_id, score
                        )));
                    }
                    score
                }
                _ => 0.0,
            };

            overall += score * weight;
            categories.push(CategoryScore {
                category: *category,
                weight: *weight,
                score,
                kind,
                task_status: task.map(|t| t.status),
            });
        }

        let overall = overall.clamp(0.0, 100.0);
        let dispatched = tasks.len();
        let succeeded = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count();
        let confidence = if dispatched == 0 {
            0.0
        } else {
            succeeded as f64 / dispatched as f64
        };

        debug!(
            overall,
            confidence,
            succeeded,
            dispatched,
            "Aggregate risk recomputed"
        );

        Ok(AggregateRisk {
            overall_score: overall,
            categories,
            confidence,
            confidence_level: confidence_level(confidence),
            recommendation: recommend(overall),
            provisional: true,
            succeeded,
            dispatched,
        })
    }
}

impl Default for RiskAggregator {
    fn default() -> Self {
        Self::new(RiskModel::default())
    }
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SpecialistKind;
    use uuid::Uuid;

    fn task(kind: SpecialistKind, status: TaskStatus, score: Option<f64>) -> SpecialistTask {
        let mut t = SpecialistTask::pending(Uuid::nil(), kind);
        t.status = status;
        t.risk_score = score;
        t
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let model = RiskModel::default();
        assert!((model.weight_sum() - 1.0).abs() <= WEIGHT_TOLERANCE);
        assert!(RiskModel::new(RiskWeights::default()).is_ok());
    }

    #[test]
    fn test_bad_weight_tables_rejected() {
        let short = RiskWeights(vec![
            (RiskCategory::Behavioral, 0.5),
            (RiskCategory::Geographic, 0.4),
        ]);
        assert!(matches!(
            RiskModel::new(short),
            Err(InvestigationError::ConfigError(_))
        ));

        let negative = RiskWeights(vec![
            (RiskCategory::Behavioral, 1.5),
            (RiskCategory::Geographic, -0.5),
        ]);
        assert!(RiskModel::new(negative).is_err());

        let duplicate = RiskWeights(vec![
            (RiskCategory::Behavioral, 0.5),
            (RiskCategory::Behavioral, 0.5),
        ]);
        assert!(RiskModel::new(duplicate).is_err());
    }

    #[test]
    fn test_threshold_boundaries() {
        assert_eq!(recommend(75.0), Recommendation::File);
        assert_eq!(recommend(74.999), Recommendation::Monitor);
        assert_eq!(recommend(40.0), Recommendation::Monitor);
        assert_eq!(recommend(39.999), Recommendation::Clear);
        assert_eq!(recommend(100.0), Recommendation::File);
        assert_eq!(recommend(0.0), Recommendation::Clear);
    }

    #[test]
    fn test_confidence_levels() {
        assert_eq!(confidence_level(0.49), ConfidenceLevel::Low);
        assert_eq!(confidence_level(0.5), ConfidenceLevel::Medium);
        assert_eq!(confidence_level(0.89), ConfidenceLevel::Medium);
        assert_eq!(confidence_level(0.9), ConfidenceLevel::High);
    }

    #[test]
    fn test_all_four_succeed() {
        let aggregator = RiskAggregator::default();
        let tasks = vec![
            task(SpecialistKind::EntityResearch, TaskStatus::Succeeded, Some(90.0)),
            task(SpecialistKind::GeographicRouting, TaskStatus::Succeeded, Some(90.0)),
            task(SpecialistKind::TransactionPattern, TaskStatus::Succeeded, Some(90.0)),
            task(SpecialistKind::ChainTracing, TaskStatus::Succeeded, Some(85.0)),
        ];

        let risk = aggregator.recompute(&tasks).unwrap();
        assert!((risk.overall_score - 88.75).abs() < 1e-9);
        assert_eq!(risk.recommendation, Recommendation::File);
        assert_eq!(risk.confidence_level, ConfidenceLevel::High);
        assert!(!risk.provisional);
    }

    #[test]
    fn test_one_of_two_timed_out() {
        let aggregator = RiskAggregator::default();
        let mut timed_out = task(SpecialistKind::GeographicRouting, TaskStatus::TimedOut, None);
        timed_out.error = Some("exceeded 5s".into());
        let tasks = vec![
            task(SpecialistKind::TransactionPattern, TaskStatus::Succeeded, Some(80.0)),
            timed_out,
        ];

        let risk = aggregator.recompute(&tasks).unwrap();
        assert_eq!(risk.confidence, 0.5);
        assert_eq!(risk.confidence_level, ConfidenceLevel::Medium);
        assert!(risk.provisional);
        // undispatched and failed categories still count in the weight sum
        assert!((risk.overall_score - 20.0).abs() < 1e-9);
        assert_eq!(risk.recommendation, Recommendation::Clear);
    }

    #[test]
    fn test_nothing_completed() {
        let aggregator = RiskAggregator::default();

        let risk = aggregator.recompute_aborted(&[]).unwrap();
        assert_eq!(risk.overall_score, 0.0);
        assert_eq!(risk.confidence_level, ConfidenceLevel::Low);
        assert!(risk.provisional);

        let cancelled = vec![task(SpecialistKind::TransactionPattern, TaskStatus::Cancelled, None)];
        let risk = aggregator.recompute_aborted(&cancelled).unwrap();
        assert_eq!(risk.overall_score, 0.0);
        assert_eq!(risk.confidence, 0.0);
        assert!(risk.provisional);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let aggregator = RiskAggregator::default();
        let tasks = vec![
            task(SpecialistKind::EntityResearch, TaskStatus::Succeeded, Some(61.0)),
            task(SpecialistKind::ChainTracing, TaskStatus::Running, None),
        ];

        let first = aggregator.recompute(&tasks).unwrap();
        let second = aggregator.recompute(&tasks).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invariant_violations() {
        let aggregator = RiskAggregator::default();

        let missing = vec![task(SpecialistKind::EntityResearch, TaskStatus::Succeeded, None)];
        assert!(matches!(
            aggregator.recompute(&missing),
            Err(InvestigationError::AggregationError(_))
        ));

        let out_of_range = vec![task(SpecialistKind::EntityResearch, TaskStatus::Succeeded, Some(140.0))];
        assert!(matches!(
            aggregator.recompute(&out_of_range),
            Err(InvestigationError::AggregationError(_))
        ));
    }

    #[test]
    fn test_custom_weights() {
        let model = RiskModel::new(RiskWeights(vec![
            (RiskCategory::Behavioral, 0.1),
            (RiskCategory::Geographic, 0.2),
            (RiskCategory::Transactional, 0.3),
            (RiskCategory::Typology, 0.4),
        ]))
        .unwrap();
        let aggregator = RiskAggregator::new(model);

        let tasks = vec![task(SpecialistKind::ChainTracing, TaskStatus::Succeeded, Some(100.0))];
        let risk = aggregator.recompute(&tasks).unwrap();
        assert!((risk.overall_score - 40.0).abs() < 1e-9);
        assert_eq!(risk.recommendation, Recommendation::Monitor);
        assert!(!risk.provisional);
    }
}
