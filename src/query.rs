//! Typed queries selecting one stored hidden-state tensor

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How the per-instance representation was pooled over tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Last-token representation
    Last,
    /// Mean over prompt tokens
    Mean,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Mean => "mean",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last" => Ok(Self::Last),
            "mean" => Ok(Self::Mean),
            other => anyhow::bail!("Unknown method '{other}' (expected 'last' or 'mean')"),
        }
    }
}

/// Selects one stored tensor and its instance records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorQuery {
    model_name: String,
    method: Method,
    train_instances: u32,
    dataset: String,
}

impl TensorQuery {
    /// Create a query, rejecting empty model or dataset names
    pub fn new(
        model_name: impl Into<String>,
        method: Method,
        train_instances: u32,
        dataset: impl Into<String>,
    ) -> Result<Self> {
        let model_name = model_name.into();
        let dataset = dataset.into();
        anyhow::ensure!(!model_name.trim().is_empty(), "Query model name is empty");
        anyhow::ensure!(!dataset.trim().is_empty(), "Query dataset is empty");
        Ok(Self {
            model_name,
            method,
            train_instances,
            dataset,
        })
    }

    /// Cartesian product of models x methods x shot counts for one dataset
    pub fn grid(
        models: &[String],
        methods: &[Method],
        shots: &[u32],
        dataset: &str,
    ) -> Result<Vec<Self>> {
        let mut queries = Vec::with_capacity(models.len() * methods.len() * shots.len());
        for model in models {
            for &method in methods {
                for &shot in shots {
                    queries.push(Self::new(model.clone(), method, shot, dataset)?);
                }
            }
        }
        Ok(queries)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Number of few-shot demonstrations in the prompt
    pub fn train_instances(&self) -> u32 {
        self.train_instances
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Whether a record's dataset falls under this query's selector.
    ///
    /// `mmlu` matches `mmlu` and every `mmlu:<subject>`.
    pub fn matches_dataset(&self, dataset: &str) -> bool {
        dataset == self.dataset
            || dataset
                .strip_prefix(self.dataset.as_str())
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl fmt::Display for TensorQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {}-shot / {}",
            self.model_name, self.method, self.train_instances, self.dataset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_fields() {
        assert!(TensorQuery::new("", Method::Last, 0, "mmlu").is_err());
        assert!(TensorQuery::new("llama-2-7b", Method::Last, 0, " ").is_err());
    }

    #[test]
    fn test_dataset_selector() {
        let q = TensorQuery::new("llama-2-7b", Method::Last, 5, "mmlu").unwrap();
        assert!(q.matches_dataset("mmlu"));
        assert!(q.matches_dataset("mmlu:miscellaneous"));
        assert!(!q.matches_dataset("mmlu_pro:law"));
        assert!(!q.matches_dataset("arc"));

        let q = TensorQuery::new("llama-2-7b", Method::Last, 5, "mmlu:miscellaneous").unwrap();
        assert!(q.matches_dataset("mmlu:miscellaneous"));
        assert!(!q.matches_dataset("mmlu:anatomy"));
    }

    #[test]
    fn test_grid_order() {
        let models = vec!["a".to_string(), "b".to_string()];
        let queries = TensorQuery::grid(&models, &[Method::Last], &[0, 5], "mmlu").unwrap();
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0].model_name(), "a");
        assert_eq!(queries[1].train_instances(), 5);
        assert_eq!(queries[2].model_name(), "b");
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("last".parse::<Method>().unwrap(), Method::Last);
        assert!("first".parse::<Method>().is_err());
        assert_eq!(Method::Mean.to_string(), "mean");
    }
}
