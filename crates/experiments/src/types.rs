use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Variant configuration as authored on a `split` step: a display name,
/// a relative weight, and the successor step the variant routes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub weight: u32,
    pub next_step_id: Uuid,
}

/// Lifecycle status of a split experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Paused,
    Completed,
}

/// Metric a winner is declared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinningMetric {
    ConversionRate,
    OpenRate,
    ClickRate,
}

/// Running counters for one variant. Derived view: recomputable from the
/// assignment rows if it ever drifts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantCounters {
    pub enrollments: u64,
    pub conversions: u64,
    pub opens: u64,
    pub clicks: u64,
    pub revenue: f64,
}

/// One branch of a split experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub name: String,
    pub weight: u32,
    pub next_step_id: Uuid,
    pub counters: VariantCounters,
}

impl Variant {
    pub fn from_spec(spec: &VariantSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            weight: spec.weight,
            next_step_id: spec.next_step_id,
            counters: VariantCounters::default(),
        }
    }

    pub fn rate(&self, metric: WinningMetric) -> f64 {
        if self.counters.enrollments == 0 {
            return 0.0;
        }
        let numerator = match metric {
            WinningMetric::ConversionRate => self.counters.conversions,
            WinningMetric::OpenRate => self.counters.opens,
            WinningMetric::ClickRate => self.counters.clicks,
        };
        numerator as f64 / self.counters.enrollments as f64
    }

    fn successes(&self, metric: WinningMetric) -> u64 {
        match metric {
            WinningMetric::ConversionRate => self.counters.conversions,
            WinningMetric::OpenRate => self.counters.opens,
            WinningMetric::ClickRate => self.counters.clicks,
        }
    }

    pub fn observations(&self, metric: WinningMetric) -> (u64, u64) {
        (self.successes(metric), self.counters.enrollments)
    }
}

/// A split-step experiment and its variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitExperiment {
    pub id: Uuid,
    pub funnel_id: Uuid,
    pub split_step_id: Uuid,
    pub name: String,
    pub status: ExperimentStatus,
    /// Confidence threshold in percent (90, 95, or 99).
    pub confidence_level: u8,
    pub winning_metric: WinningMetric,
    /// Minimum enrollments per variant before a winner may be declared.
    pub min_sample_per_variant: u64,
    pub winner_variant_id: Option<Uuid>,
    pub variants: Vec<Variant>,
    pub started_at: DateTime<Utc>,
    pub winner_declared_at: Option<DateTime<Utc>>,
}

impl SplitExperiment {
    pub fn total_weight(&self) -> u32 {
        self.variants.iter().map(|v| v.weight).sum()
    }

    pub fn variant(&self, variant_id: Uuid) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }
}

/// Permanent record of which variant an enrollment drew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantAssignment {
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub enrollment_id: Uuid,
    pub subscriber_id: Uuid,
    pub next_step_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
    pub conversion_value: f64,
}
