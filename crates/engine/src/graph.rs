//! Funnel definitions and the step graph: a DAG of typed steps indexed by
//! id, with successors held as ids rather than references. The loader
//! validates referential integrity before a funnel may go active, so the
//! interpreter never meets a broken graph mid-walk.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use funnel_core::error::{FunnelError, FunnelResult};
use funnel_experiments::types::VariantSpec;

use crate::evaluator::ConditionPredicate;
use crate::retry::RetryPolicy;
use crate::schedule::{DelayUnit, WaitRule};

/// Lifecycle status of a funnel definition. Only `Active` funnels accept
/// new enrollments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStatus {
    Draft,
    Active,
    Paused,
}

/// What enrolls a subscriber into a funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FunnelTrigger {
    ListSignup { list_id: Uuid },
    TagAdded { tag: String },
    FormSubmit { form_id: Uuid },
    Manual,
}

/// Objective category recorded by a `goal` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Purchase,
    Signup,
    Milestone,
    Custom,
}

/// Side effect performed by an `action` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActionKind {
    AddTag { tag: String },
    RemoveTag { tag: String },
    MoveToList { from_list_id: Uuid, to_list_id: Uuid },
    CopyToList { list_id: Uuid },
    Webhook {
        url: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Unsubscribe {
        #[serde(default)]
        list_id: Option<Uuid>,
    },
    Notify { recipient: String, message: String },
}

/// Type-specific configuration of one graph node, including its successor
/// references. Terminal `End` has none; `Condition` and `Split` carry
/// multiple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepKind {
    Start {
        next: Uuid,
    },
    Email {
        message_id: Uuid,
        next: Uuid,
    },
    Sms {
        message_id: Uuid,
        next: Uuid,
    },
    Delay {
        value: u32,
        unit: DelayUnit,
        next: Uuid,
    },
    WaitUntil {
        rule: WaitRule,
        next: Uuid,
    },
    Condition {
        predicate: ConditionPredicate,
        /// When true and the predicate is unmet, the enrollment parks on
        /// this step under the retry policy instead of branching false.
        wait_for_condition: bool,
        #[serde(default)]
        retry: RetryPolicy,
        next_on_true: Uuid,
        next_on_false: Uuid,
    },
    Action {
        action: ActionKind,
        next: Uuid,
    },
    Split {
        variants: Vec<VariantSpec>,
    },
    Goal {
        name: String,
        goal_kind: GoalKind,
        value: f64,
        next: Uuid,
    },
    End,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Start { .. } => "start",
            StepKind::Email { .. } => "email",
            StepKind::Sms { .. } => "sms",
            StepKind::Delay { .. } => "delay",
            StepKind::WaitUntil { .. } => "wait_until",
            StepKind::Condition { .. } => "condition",
            StepKind::Action { .. } => "action",
            StepKind::Split { .. } => "split",
            StepKind::Goal { .. } => "goal",
            StepKind::End => "end",
        }
    }

    /// All successor step ids this node can route to.
    pub fn successors(&self) -> Vec<Uuid> {
        match self {
            StepKind::Start { next }
            | StepKind::Email { next, .. }
            | StepKind::Sms { next, .. }
            | StepKind::Delay { next, .. }
            | StepKind::WaitUntil { next, .. }
            | StepKind::Action { next, .. }
            | StepKind::Goal { next, .. } => vec![*next],
            StepKind::Condition {
                next_on_true,
                next_on_false,
                ..
            } => vec![*next_on_true, *next_on_false],
            StepKind::Split { variants } => variants.iter().map(|v| v.next_step_id).collect(),
            StepKind::End => Vec::new(),
        }
    }
}

/// One node of a funnel's execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub id: Uuid,
    pub name: String,
    pub order: u32,
    pub kind: StepKind,
}

/// A named automation owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funnel {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: FunnelStatus,
    pub trigger: FunnelTrigger,
    pub steps: Vec<FunnelStep>,
    /// Derived stats cache, recomputable from the enrollment store.
    pub enrolled_count: u64,
    pub completed_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Funnel {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, trigger: FunnelTrigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            status: FunnelStatus::Draft,
            trigger,
            steps: Vec::new(),
            enrolled_count: 0,
            completed_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FunnelStatus::Active
    }
}

/// Validated, id-indexed view of a funnel's steps, loaded once per pass.
/// Read-only while enrollments walk it; editing a live graph requires the
/// funnel to be paused first.
#[derive(Debug, Clone)]
pub struct FunnelGraph {
    funnel_id: Uuid,
    start_id: Uuid,
    steps: HashMap<Uuid, FunnelStep>,
}

impl FunnelGraph {
    /// Load and validate a funnel's step graph.
    pub fn load(funnel: &Funnel) -> FunnelResult<Self> {
        let mut steps: HashMap<Uuid, FunnelStep> = HashMap::with_capacity(funnel.steps.len());
        for step in &funnel.steps {
            if steps.insert(step.id, step.clone()).is_some() {
                return Err(FunnelError::Graph(format!(
                    "funnel {}: duplicate step id {}",
                    funnel.id, step.id
                )));
            }
        }

        let start_ids: Vec<Uuid> = steps
            .values()
            .filter(|s| matches!(s.kind, StepKind::Start { .. }))
            .map(|s| s.id)
            .collect();
        let start_id = match start_ids.as_slice() {
            [only] => *only,
            [] => {
                return Err(FunnelError::Graph(format!(
                    "funnel {}: no start step",
                    funnel.id
                )))
            }
            _ => {
                return Err(FunnelError::Graph(format!(
                    "funnel {}: {} start steps, expected exactly one",
                    funnel.id,
                    start_ids.len()
                )))
            }
        };

        for step in steps.values() {
            for successor in step.kind.successors() {
                if !steps.contains_key(&successor) {
                    return Err(FunnelError::Graph(format!(
                        "funnel {}: step '{}' points at missing step {}",
                        funnel.id, step.name, successor
                    )));
                }
            }
            match &step.kind {
                StepKind::Split { variants } => {
                    if variants.is_empty() {
                        return Err(FunnelError::Graph(format!(
                            "funnel {}: split step '{}' has no variants",
                            funnel.id, step.name
                        )));
                    }
                    let total: u32 = variants.iter().map(|v| v.weight).sum();
                    if total == 0 {
                        return Err(FunnelError::Graph(format!(
                            "funnel {}: split step '{}' weights sum to zero",
                            funnel.id, step.name
                        )));
                    }
                }
                StepKind::Delay { value, .. } => {
                    if *value == 0 {
                        return Err(FunnelError::Graph(format!(
                            "funnel {}: delay step '{}' has a zero duration",
                            funnel.id, step.name
                        )));
                    }
                }
                _ => {}
            }
        }

        let graph = Self {
            funnel_id: funnel.id,
            start_id,
            steps,
        };
        graph.check_reachability()?;
        Ok(graph)
    }

    /// DFS from start: rejects cycles and more than one reachable terminal.
    fn check_reachability(&self) -> FunnelResult<()> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut on_stack: HashSet<Uuid> = HashSet::new();
        let mut reachable_ends = 0usize;
        self.dfs(self.start_id, &mut visited, &mut on_stack, &mut reachable_ends)?;
        if reachable_ends > 1 {
            return Err(FunnelError::Graph(format!(
                "funnel {}: {} end steps reachable from start, expected at most one",
                self.funnel_id, reachable_ends
            )));
        }
        Ok(())
    }

    fn dfs(
        &self,
        id: Uuid,
        visited: &mut HashSet<Uuid>,
        on_stack: &mut HashSet<Uuid>,
        reachable_ends: &mut usize,
    ) -> FunnelResult<()> {
        if on_stack.contains(&id) {
            return Err(FunnelError::Graph(format!(
                "funnel {}: cycle through step {}",
                self.funnel_id, id
            )));
        }
        if !visited.insert(id) {
            return Ok(());
        }
        on_stack.insert(id);
        // Successor existence was checked above.
        if let Some(step) = self.steps.get(&id) {
            if matches!(step.kind, StepKind::End) {
                *reachable_ends += 1;
            }
            for successor in step.kind.successors() {
                self.dfs(successor, visited, on_stack, reachable_ends)?;
            }
        }
        on_stack.remove(&id);
        Ok(())
    }

    pub fn funnel_id(&self) -> Uuid {
        self.funnel_id
    }

    pub fn start_id(&self) -> Uuid {
        self.start_id
    }

    /// Ids of all split steps in the graph.
    pub fn split_step_ids(&self) -> Vec<Uuid> {
        self.steps
            .values()
            .filter(|s| matches!(s.kind, StepKind::Split { .. }))
            .map(|s| s.id)
            .collect()
    }

    pub fn step(&self, id: Uuid) -> FunnelResult<&FunnelStep> {
        self.steps.get(&id).ok_or_else(|| {
            FunnelError::Graph(format!(
                "funnel {}: step {} not in graph",
                self.funnel_id, id
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
