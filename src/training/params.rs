use std::collections::HashSet;

use super::TrainingError;
use crate::model::{ParamId, Parameter};

/// Ordered identities of the tensors the optimizer may update.
///
/// Built once per training module; the order is backbone first, then head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainableParameterSet {
    entries: Vec<(ParamId, String)>,
}

impl TrainableParameterSet {
    /// Fails if the same tensor appears twice.
    pub fn from_parameters<'a>(
        params: impl IntoIterator<Item = &'a Parameter>,
    ) -> Result<Self, TrainingError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for param in params {
            if !seen.insert(param.id()) {
                return Err(TrainingError::Config(format!(
                    "parameter {} ({}) is listed twice",
                    param.id(),
                    param.name()
                )));
            }
            entries.push((param.id(), param.name().to_string()));
        }
        Ok(Self { entries })
    }

    pub fn ids(&self) -> Vec<ParamId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, name)| name.as_str())
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.entries.iter().any(|(p, _)| *p == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
