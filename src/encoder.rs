use std::{collections::BTreeSet, fs, path::Path};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One-hot encoding over the labels seen while fitting.
///
/// Classes are kept sorted, so a class's index is its position in that order. The
/// same fitted encoder has to be used for training, evaluation and later inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Fits over the distinct labels present, not over the configured allow-list.
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let classes: Vec<String> = labels
            .iter()
            .map(|label| label.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if classes.len() < 2 {
            return Err(Error::DegenerateLabels(classes));
        }

        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn index_of(&self, label: &str) -> Result<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(label))
            .map_err(|_| Error::UnknownLabel(label.to_string()))
    }

    pub fn class_name(&self, index: usize) -> Result<&str> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(Error::UnknownClassIndex(index))
    }

    /// Encodes `labels` as an `N x num_classes` matrix with a single 1 per row.
    pub fn transform<S: AsRef<str>>(&self, labels: &[S]) -> Result<Array2<f32>> {
        let mut encoded = Array2::zeros((labels.len(), self.num_classes()));
        for (row, label) in labels.iter().enumerate() {
            encoded[[row, self.index_of(label.as_ref())?]] = 1.0;
        }
        Ok(encoded)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, rmp_serde::to_vec(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}
