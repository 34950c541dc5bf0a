//! Split/experiment manager: weighted variant assignment, enrollment and
//! conversion bookkeeping, and operator-requested winner declaration.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::statistics::{two_proportion_z, z_threshold};
use crate::types::{
    ExperimentStatus, SplitExperiment, Variant, VariantAssignment, VariantSpec, WinningMetric,
};

/// Outcome of an operator's declare-winner request.
#[derive(Debug, Clone, PartialEq)]
pub enum WinnerDecision {
    Winner { variant_id: Uuid, z_score: f64 },
    NotYetSignificant { z_score: f64, reason: String },
}

/// Owns one experiment per split step plus the permanent per-enrollment
/// variant assignments.
#[derive(Default)]
pub struct SplitManager {
    experiments: DashMap<Uuid, SplitExperiment>,
    assignments: DashMap<(Uuid, Uuid), VariantAssignment>,
}

impl SplitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily materialize the experiment backing a split step from the
    /// step's variant configuration.
    pub fn get_or_create(
        &self,
        funnel_id: Uuid,
        split_step_id: Uuid,
        name: &str,
        specs: &[VariantSpec],
    ) -> SplitExperiment {
        self.experiments
            .entry(split_step_id)
            .or_insert_with(|| {
                info!(
                    step_id = %split_step_id,
                    variants = specs.len(),
                    "creating split experiment"
                );
                SplitExperiment {
                    id: Uuid::new_v4(),
                    funnel_id,
                    split_step_id,
                    name: name.to_string(),
                    status: ExperimentStatus::Running,
                    confidence_level: 95,
                    winning_metric: WinningMetric::ConversionRate,
                    min_sample_per_variant: 30,
                    winner_variant_id: None,
                    variants: specs.iter().map(Variant::from_spec).collect(),
                    started_at: Utc::now(),
                    winner_declared_at: None,
                }
            })
            .clone()
    }

    pub fn experiment(&self, split_step_id: Uuid) -> Option<SplitExperiment> {
        self.experiments.get(&split_step_id).map(|e| e.clone())
    }

    pub fn assignment(&self, split_step_id: Uuid, enrollment_id: Uuid) -> Option<VariantAssignment> {
        self.assignments
            .get(&(split_step_id, enrollment_id))
            .map(|a| a.clone())
    }

    /// Assign a variant for this enrollment, or return the stored
    /// assignment. Assignment is permanent: repeated calls never re-roll.
    pub fn assign(
        &self,
        funnel_id: Uuid,
        split_step_id: Uuid,
        step_name: &str,
        specs: &[VariantSpec],
        enrollment_id: Uuid,
        subscriber_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<VariantAssignment> {
        if let Some(existing) = self.assignment(split_step_id, enrollment_id) {
            return Ok(existing);
        }

        let experiment = self.get_or_create(funnel_id, split_step_id, step_name, specs);
        let total_weight = experiment.total_weight();
        if total_weight == 0 {
            return Err(anyhow!(
                "split step {} has zero total variant weight",
                split_step_id
            ));
        }

        let roll = rand::thread_rng().gen_range(1..=total_weight);
        self.assign_with_roll(&experiment, enrollment_id, subscriber_id, roll, now)
    }

    fn assign_with_roll(
        &self,
        experiment: &SplitExperiment,
        enrollment_id: Uuid,
        subscriber_id: Uuid,
        roll: u32,
        now: DateTime<Utc>,
    ) -> Result<VariantAssignment> {
        let mut cumulative = 0u32;
        let mut chosen = experiment
            .variants
            .first()
            .ok_or_else(|| anyhow!("split experiment {} has no variants", experiment.id))?;
        for variant in &experiment.variants {
            cumulative += variant.weight;
            if roll <= cumulative {
                chosen = variant;
                break;
            }
        }

        let assignment = VariantAssignment {
            experiment_id: experiment.id,
            variant_id: chosen.id,
            enrollment_id,
            subscriber_id,
            next_step_id: chosen.next_step_id,
            assigned_at: now,
            converted_at: None,
            conversion_value: 0.0,
        };

        // A racing worker may have assigned between our lookup and here;
        // the stored row always wins.
        let key = (experiment.split_step_id, enrollment_id);
        match self.assignments.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(assignment.clone());
            }
        }

        if let Some(mut experiment) = self.experiments.get_mut(&experiment.split_step_id) {
            if let Some(variant) = experiment.variants.iter_mut().find(|v| v.id == chosen.id) {
                variant.counters.enrollments += 1;
            }
        }

        info!(
            step_id = %experiment.split_step_id,
            enrollment_id = %enrollment_id,
            variant = %chosen.name,
            "assigned split variant"
        );
        Ok(assignment)
    }

    /// Record a conversion for an enrolled subscriber. Idempotent per
    /// (step, enrollment); returns false when no assignment exists or the
    /// conversion was already counted.
    pub fn record_conversion(
        &self,
        split_step_id: Uuid,
        enrollment_id: Uuid,
        value: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let variant_id = {
            let mut assignment =
                match self.assignments.get_mut(&(split_step_id, enrollment_id)) {
                    Some(a) => a,
                    None => return false,
                };
            if assignment.converted_at.is_some() {
                return false;
            }
            assignment.converted_at = Some(now);
            assignment.conversion_value = value;
            assignment.variant_id
        };

        if let Some(mut experiment) = self.experiments.get_mut(&split_step_id) {
            if let Some(variant) = experiment.variants.iter_mut().find(|v| v.id == variant_id) {
                variant.counters.conversions += 1;
                variant.counters.revenue += value;
            }
        }
        true
    }

    /// Credit an open to the enrollment's variant.
    pub fn record_open(&self, split_step_id: Uuid, enrollment_id: Uuid) {
        self.bump_counter(split_step_id, enrollment_id, |c| c.opens += 1);
    }

    /// Credit a click to the enrollment's variant.
    pub fn record_click(&self, split_step_id: Uuid, enrollment_id: Uuid) {
        self.bump_counter(split_step_id, enrollment_id, |c| c.clicks += 1);
    }

    fn bump_counter(
        &self,
        split_step_id: Uuid,
        enrollment_id: Uuid,
        f: impl FnOnce(&mut crate::types::VariantCounters),
    ) {
        let variant_id = match self.assignments.get(&(split_step_id, enrollment_id)) {
            Some(a) => a.variant_id,
            None => return,
        };
        if let Some(mut experiment) = self.experiments.get_mut(&split_step_id) {
            if let Some(variant) = experiment.variants.iter_mut().find(|v| v.id == variant_id) {
                f(&mut variant.counters);
            }
        }
    }

    /// Apply new weights to an experiment. Only enrollments assigned after
    /// the change see the new distribution; stored assignments stand.
    pub fn update_weights(&self, split_step_id: Uuid, weights: &[(Uuid, u32)]) -> Result<()> {
        let mut experiment = self
            .experiments
            .get_mut(&split_step_id)
            .ok_or_else(|| anyhow!("no experiment for split step {}", split_step_id))?;
        for (variant_id, weight) in weights {
            if let Some(variant) = experiment.variants.iter_mut().find(|v| v.id == *variant_id) {
                variant.weight = *weight;
            }
        }
        Ok(())
    }

    /// Compare the leading variant against the runner-up on the configured
    /// metric. Declares and stores a winner only past the significance
    /// threshold; otherwise reports not-yet-significant.
    pub fn declare_winner(&self, split_step_id: Uuid, now: DateTime<Utc>) -> Result<WinnerDecision> {
        let mut experiment = self
            .experiments
            .get_mut(&split_step_id)
            .ok_or_else(|| anyhow!("no experiment for split step {}", split_step_id))?;

        if let Some(winner_id) = experiment.winner_variant_id {
            return Ok(WinnerDecision::Winner {
                variant_id: winner_id,
                z_score: 0.0,
            });
        }
        if experiment.variants.len() < 2 {
            return Err(anyhow!(
                "experiment {} needs at least two variants",
                experiment.id
            ));
        }

        let metric = experiment.winning_metric;
        let mut ranked: Vec<&Variant> = experiment.variants.iter().collect();
        ranked.sort_by(|a, b| {
            b.rate(metric)
                .partial_cmp(&a.rate(metric))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let leader = ranked[0];
        let runner_up = ranked[1];

        let min_sample = experiment.min_sample_per_variant;
        if leader.counters.enrollments < min_sample || runner_up.counters.enrollments < min_sample
        {
            return Ok(WinnerDecision::NotYetSignificant {
                z_score: 0.0,
                reason: format!("need at least {} enrollments per variant", min_sample),
            });
        }

        let (leader_successes, leader_n) = leader.observations(metric);
        let (runner_successes, runner_n) = runner_up.observations(metric);
        let z = two_proportion_z(leader_successes, leader_n, runner_successes, runner_n);
        let threshold = z_threshold(experiment.confidence_level);

        if z < threshold {
            return Ok(WinnerDecision::NotYetSignificant {
                z_score: z,
                reason: format!("z {:.3} below {:.3} threshold", z, threshold),
            });
        }

        let winner_id = leader.id;
        let winner_name = leader.name.clone();
        experiment.status = ExperimentStatus::Completed;
        experiment.winner_variant_id = Some(winner_id);
        experiment.winner_declared_at = Some(now);

        info!(
            step_id = %split_step_id,
            winner = %winner_name,
            z_score = z,
            "declared split winner"
        );
        Ok(WinnerDecision::Winner {
            variant_id: winner_id,
            z_score: z,
        })
    }
}
