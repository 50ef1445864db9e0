//! Dense integer labels from a categorical metadata field

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hidden_states::{HiddenStates, MetaField};

/// Integer codes for one metadata field, aligned with the instance axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoding {
    /// Distinct literals in ascending order; code `c` stands for `classes[c]`
    pub classes: Vec<String>,
    /// One code per instance
    pub labels: Vec<i32>,
}

impl LabelEncoding {
    /// Encode `field` by ranking its distinct literals.
    ///
    /// Codes are only meaningful for this call: a different literal set
    /// yields a different mapping.
    pub fn from_field(hidden_states: &HiddenStates, field: MetaField) -> Result<Self> {
        let literals: Vec<&str> = hidden_states
            .records()
            .iter()
            .enumerate()
            .map(|(i, r)| {
                r.field(field)
                    .with_context(|| format!("Instance {i} has no '{field}' value"))
            })
            .collect::<Result<_>>()?;

        let mut classes: Vec<String> = literals.iter().map(|s| (*s).to_string()).collect();
        classes.sort();
        classes.dedup();

        let labels = literals
            .iter()
            .map(|lit| {
                // classes is sorted and contains every literal
                let code = classes.binary_search_by(|c| c.as_str().cmp(lit)).unwrap_or(0);
                code as i32
            })
            .collect();

        Ok(Self { classes, labels })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
