//! Task identifier → evaluator constructor table.

use std::sync::Arc;

use crate::error::ControlError;
use crate::evaluator::{
    DumpIntoMouthEvaluator, Evaluator, GrabHoldEvaluator, HoldAtMouthEvaluator,
    LiftToMouthEvaluator, PlaceCupDownEvaluator, ReachEvaluator,
};

pub type EvaluatorFactory = Arc<dyn Fn() -> Box<dyn Evaluator> + Send + Sync>;

/// One selectable task.
#[derive(Clone)]
pub struct TaskEntry {
    pub id: String,
    pub aliases: Vec<String>,
    factory: EvaluatorFactory,
}

impl TaskEntry {
    pub fn matches(&self, name: &str) -> bool {
        self.id == name || self.aliases.iter().any(|a| a == name)
    }

    pub fn build(&self) -> Box<dyn Evaluator> {
        (self.factory)()
    }
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.id)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

/// Registry of selectable tasks. Lookup is by canonical id or alias,
/// case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    entries: Vec<TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The six built-in exercise steps, with the short ids older clients send.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register("reach", &["reach_bottle"], || Box::new(ReachEvaluator::new()));
        reg.register("grab_hold", &["hold_cup"], || {
            Box::new(GrabHoldEvaluator::new())
        });
        reg.register("lift_to_mouth", &["lift_cup"], || {
            Box::new(LiftToMouthEvaluator::new())
        });
        reg.register("hold_at_mouth", &["hold_mouth"], || {
            Box::new(HoldAtMouthEvaluator::new())
        });
        reg.register("dump_into_mouth", &["tip_cup"], || {
            Box::new(DumpIntoMouthEvaluator::new())
        });
        reg.register("place_cup_down", &["place_down"], || {
            Box::new(PlaceCupDownEvaluator::new())
        });
        reg
    }

    /// Register a task. A later registration with the same id replaces the earlier one.
    pub fn register<F>(&mut self, id: &str, aliases: &[&str], factory: F)
    where
        F: Fn() -> Box<dyn Evaluator> + Send + Sync + 'static,
    {
        self.entries.retain(|e| e.id != id);
        self.entries.push(TaskEntry {
            id: id.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            factory: Arc::new(factory),
        });
    }

    pub fn lookup(&self, name: &str) -> Option<&TaskEntry> {
        let name = name.trim().to_ascii_lowercase();
        self.entries.iter().find(|e| e.matches(&name))
    }

    /// Canonical id for `name`, or `UnknownTask`.
    pub fn resolve(&self, name: &str) -> Result<&TaskEntry, ControlError> {
        self.lookup(name)
            .ok_or_else(|| ControlError::UnknownTask(name.to_string()))
    }

    /// Canonical ids in registration order.
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
