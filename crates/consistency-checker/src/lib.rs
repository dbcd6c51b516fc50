//! Cross-source consistency checking.
//!
//! Given comparable records from two providers, computes per-field
//! relative deltas against configured tolerances and a weighted
//! confidence score, then recommends how the caller should resolve the
//! conflict. The checker never mutates data.

use serde::{Deserialize, Serialize};

use market_core::FinancialSnapshot;

/// Conflict-resolution directive derived from the confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Directive {
    /// Sources agree; either one is safe to persist.
    UseEither,
    /// Minor disagreement; persist the primary and log a warning.
    UsePrimaryWarn,
    /// Significant disagreement; persist only the primary.
    UsePrimaryOnly,
    /// Sources disagree badly enough that both are suspect.
    Investigate,
}

impl Directive {
    fn from_score(score: f64) -> Directive {
        if score > 0.8 {
            Directive::UseEither
        } else if score > 0.6 {
            Directive::UsePrimaryWarn
        } else if score > 0.3 {
            Directive::UsePrimaryOnly
        } else {
            Directive::Investigate
        }
    }
}

/// One field compared across two sources.
#[derive(Debug, Clone, Serialize)]
pub struct FieldComparison {
    pub field: &'static str,
    pub primary_value: f64,
    pub secondary_value: f64,
    /// |a-b| / |a|
    pub delta: f64,
    pub tolerance: f64,
    pub is_significant: bool,
}

/// Result of one cross-source check.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub primary_source: String,
    pub secondary_source: String,
    pub confidence_score: f64,
    pub directive: Directive,
    pub comparisons: Vec<FieldComparison>,
}

/// Per-field tolerances and weights. Defaults carry the production
/// values; per-market overrides come from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    pub price_tolerance: f64,
    pub total_mv_tolerance: f64,
    pub pe_tolerance: f64,
    pub pb_tolerance: f64,
    pub volume_tolerance: f64,
    pub turnover_tolerance: f64,

    pub pe_weight: f64,
    pub pb_weight: f64,
    pub total_mv_weight: f64,
    pub price_weight: f64,
    pub volume_weight: f64,
    pub turnover_weight: f64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            price_tolerance: 0.01,
            total_mv_tolerance: 0.02,
            pe_tolerance: 0.05,
            pb_tolerance: 0.05,
            volume_tolerance: 0.10,
            turnover_tolerance: 0.05,

            pe_weight: 0.25,
            pb_weight: 0.25,
            total_mv_weight: 0.20,
            price_weight: 0.15,
            volume_weight: 0.10,
            turnover_weight: 0.05,
        }
    }
}

pub struct ConsistencyChecker {
    config: ConsistencyConfig,
}

impl ConsistencyChecker {
    pub fn new(config: ConsistencyConfig) -> Self {
        Self { config }
    }

    /// Compare the valuation snapshots two providers produced for the same
    /// symbol. Fields missing on either side are skipped; weights are
    /// renormalized over the fields actually compared.
    pub fn check_snapshot(
        &self,
        primary: &FinancialSnapshot,
        secondary: &FinancialSnapshot,
        primary_source: &str,
        secondary_source: &str,
    ) -> ConsistencyReport {
        let candidates: [(&'static str, Option<f64>, Option<f64>, f64, f64); 5] = [
            (
                "pe",
                primary.pe,
                secondary.pe,
                self.config.pe_tolerance,
                self.config.pe_weight,
            ),
            (
                "pb",
                primary.pb,
                secondary.pb,
                self.config.pb_tolerance,
                self.config.pb_weight,
            ),
            (
                "total_mv",
                primary.total_mv,
                secondary.total_mv,
                self.config.total_mv_tolerance,
                self.config.total_mv_weight,
            ),
            (
                "turnover_rate",
                primary.turnover_rate,
                secondary.turnover_rate,
                self.config.turnover_tolerance,
                self.config.turnover_weight,
            ),
            (
                "volume_ratio",
                primary.volume_ratio,
                secondary.volume_ratio,
                self.config.volume_tolerance,
                self.config.volume_weight,
            ),
        ];

        let mut comparisons = Vec::new();
        let mut total_weight = 0.0;
        let mut weighted_score = 0.0;

        for (field, a, b, tolerance, weight) in candidates {
            let (a, b) = match (a, b) {
                (Some(a), Some(b)) if a != 0.0 => (a, b),
                _ => continue,
            };
            let delta = (a - b).abs() / a.abs();
            let field_score = (1.0 - delta / tolerance).max(0.0);
            total_weight += weight;
            weighted_score += weight * field_score;
            comparisons.push(FieldComparison {
                field,
                primary_value: a,
                secondary_value: b,
                delta,
                tolerance,
                is_significant: delta > tolerance,
            });
        }

        let confidence_score = if total_weight > 0.0 {
            weighted_score / total_weight
        } else {
            0.0
        };
        let directive = if comparisons.is_empty() {
            // Nothing comparable: stay with the primary.
            Directive::UsePrimaryOnly
        } else {
            Directive::from_score(confidence_score)
        };

        if matches!(directive, Directive::UsePrimaryWarn | Directive::UsePrimaryOnly) {
            tracing::warn!(
                primary = primary_source,
                secondary = secondary_source,
                confidence = format!("{confidence_score:.2}"),
                directive = ?directive,
                "[WARN] cross-source disagreement"
            );
        } else if matches!(directive, Directive::Investigate) {
            tracing::error!(
                primary = primary_source,
                secondary = secondary_source,
                confidence = format!("{confidence_score:.2}"),
                "[FAIL] sources disagree badly; investigate"
            );
        }

        ConsistencyReport {
            primary_source: primary_source.to_string(),
            secondary_source: secondary_source.to_string(),
            confidence_score,
            directive,
            comparisons,
        }
    }

    /// Compare two prices alone (quote reconciliation).
    pub fn check_price(
        &self,
        primary: f64,
        secondary: f64,
        primary_source: &str,
        secondary_source: &str,
    ) -> ConsistencyReport {
        let delta = if primary != 0.0 {
            (primary - secondary).abs() / primary.abs()
        } else {
            f64::INFINITY
        };
        let score = (1.0 - delta / self.config.price_tolerance).max(0.0);
        ConsistencyReport {
            primary_source: primary_source.to_string(),
            secondary_source: secondary_source.to_string(),
            confidence_score: score,
            directive: Directive::from_score(score),
            comparisons: vec![FieldComparison {
                field: "price",
                primary_value: primary,
                secondary_value: secondary,
                delta,
                tolerance: self.config.price_tolerance,
                is_significant: delta > self.config.price_tolerance,
            }],
        }
    }
}

impl Default for ConsistencyChecker {
    fn default() -> Self {
        Self::new(ConsistencyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pe: f64, pb: f64, total_mv: f64) -> FinancialSnapshot {
        FinancialSnapshot {
            pe: Some(pe),
            pb: Some(pb),
            total_mv: Some(total_mv),
            ..Default::default()
        }
    }

    #[test]
    fn identical_snapshots_score_one() {
        let checker = ConsistencyChecker::default();
        let a = snapshot(12.0, 1.5, 820.0);
        let report = checker.check_snapshot(&a, &a.clone(), "tushare", "akshare");
        assert!((report.confidence_score - 1.0).abs() < 1e-9);
        assert_eq!(report.directive, Directive::UseEither);
        assert!(report.comparisons.iter().all(|c| !c.is_significant));
    }

    #[test]
    fn twenty_percent_pe_gap_forces_primary_only() {
        let checker = ConsistencyChecker::default();
        // PE differs by 20% (score 0), PB agrees (score 1); equal weights
        // put the blend at 0.5.
        let primary = FinancialSnapshot {
            pe: Some(10.0),
            pb: Some(1.5),
            ..Default::default()
        };
        let secondary = FinancialSnapshot {
            pe: Some(12.0),
            pb: Some(1.5),
            ..Default::default()
        };
        let report = checker.check_snapshot(&primary, &secondary, "tushare", "akshare");
        assert!(report.confidence_score <= 0.6, "{}", report.confidence_score);
        assert!(report.confidence_score > 0.3);
        assert_eq!(report.directive, Directive::UsePrimaryOnly);
        let pe = report
            .comparisons
            .iter()
            .find(|c| c.field == "pe")
            .unwrap();
        assert!(pe.is_significant);
    }

    #[test]
    fn small_disagreement_warns_but_keeps_primary() {
        let checker = ConsistencyChecker::default();
        // PE off by 20%, PB and market cap agree: weighted score ~0.64.
        let primary = snapshot(10.0, 1.5, 820.0);
        let secondary = snapshot(12.0, 1.5, 820.0);
        let report = checker.check_snapshot(&primary, &secondary, "tushare", "akshare");
        assert!(report.confidence_score > 0.6 && report.confidence_score <= 0.8);
        assert_eq!(report.directive, Directive::UsePrimaryWarn);
    }

    #[test]
    fn totally_divergent_snapshots_investigate() {
        let checker = ConsistencyChecker::default();
        let primary = snapshot(10.0, 1.0, 500.0);
        let secondary = snapshot(30.0, 4.0, 2000.0);
        let report = checker.check_snapshot(&primary, &secondary, "a", "b");
        assert!(report.confidence_score <= 0.3);
        assert_eq!(report.directive, Directive::Investigate);
    }

    #[test]
    fn missing_fields_are_skipped_not_penalized() {
        let checker = ConsistencyChecker::default();
        let primary = FinancialSnapshot {
            pe: Some(10.0),
            ..Default::default()
        };
        let secondary = FinancialSnapshot {
            pe: Some(10.05),
            pb: Some(99.0),
            ..Default::default()
        };
        let report = checker.check_snapshot(&primary, &secondary, "a", "b");
        assert_eq!(report.comparisons.len(), 1);
        assert_eq!(report.directive, Directive::UseEither);
    }

    #[test]
    fn nothing_comparable_stays_with_primary() {
        let checker = ConsistencyChecker::default();
        let report = checker.check_snapshot(
            &FinancialSnapshot::default(),
            &FinancialSnapshot::default(),
            "a",
            "b",
        );
        assert_eq!(report.directive, Directive::UsePrimaryOnly);
        assert_eq!(report.confidence_score, 0.0);
    }

    #[test]
    fn price_within_tolerance_uses_either() {
        let checker = ConsistencyChecker::default();
        let report = checker.check_price(10.00, 10.005, "a", "b");
        assert_eq!(report.directive, Directive::UseEither);
        let report = checker.check_price(10.00, 9.50, "a", "b");
        assert_eq!(report.directive, Directive::Investigate);
    }
}
