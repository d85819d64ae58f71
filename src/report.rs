use std::fmt;

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    augment::BatchGenerator,
    data::{ActivityBatcher, ActivityDataset},
    encoder::LabelEncoder,
    error::Result,
    model::Model,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// Per-class precision, recall and F1 with overall accuracy and averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassificationReport {
    /// Builds the report from aligned ground-truth and predicted class indices.
    ///
    /// Undefined ratios (no predictions or no support for a class) count as zero.
    pub fn from_predictions(truth: &[usize], predicted: &[usize], class_names: &[String]) -> Self {
        let count = class_names.len();
        let mut matrix = vec![vec![0usize; count]; count];
        for (&actual, &guess) in truth.iter().zip(predicted) {
            if actual < count && guess < count {
                matrix[actual][guess] += 1;
            }
        }

        let classes: Vec<ClassMetrics> = class_names
            .iter()
            .enumerate()
            .map(|(class, name)| {
                let true_positives = matrix[class][class];
                let support: usize = matrix[class].iter().sum();
                let predicted_count: usize = matrix.iter().map(|row| row[class]).sum();

                let precision = ratio(true_positives, predicted_count);
                let recall = ratio(true_positives, support);
                let f1_score = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };

                ClassMetrics {
                    name: name.clone(),
                    precision,
                    recall,
                    f1_score,
                    support,
                }
            })
            .collect();

        let total: usize = classes.iter().map(|metrics| metrics.support).sum();
        let correct: usize = (0..count).map(|class| matrix[class][class]).sum();

        let average = |name: &str, weight: &dyn Fn(&ClassMetrics) -> f64| {
            let weights: f64 = classes.iter().map(weight).sum();
            let mean = |value: fn(&ClassMetrics) -> f64| {
                if weights == 0.0 {
                    0.0
                } else {
                    let weighted: f64 = classes
                        .iter()
                        .map(|metrics| value(metrics) * weight(metrics))
                        .sum();
                    weighted / weights
                }
            };

            ClassMetrics {
                name: name.to_string(),
                precision: mean(|metrics| metrics.precision),
                recall: mean(|metrics| metrics.recall),
                f1_score: mean(|metrics| metrics.f1_score),
                support: total,
            }
        };

        let macro_avg = average("macro avg", &|_| 1.0);
        let weighted_avg = average("weighted avg", &|metrics| metrics.support as f64);

        Self {
            accuracy: ratio(correct, total),
            classes,
            macro_avg,
            weighted_avg,
        }
    }

    pub fn class(&self, name: &str) -> Option<&ClassMetrics> {
        self.classes.iter().find(|metrics| metrics.name == name)
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|metrics| metrics.name.len())
            .chain(std::iter::once(self.weighted_avg.name.len()))
            .max()
            .unwrap_or(0);

        let row = |f: &mut fmt::Formatter<'_>, metrics: &ClassMetrics| {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                metrics.name, metrics.precision, metrics.recall, metrics.f1_score, metrics.support
            )
        };

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for metrics in &self.classes {
            row(f, metrics)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        row(f, &self.macro_avg)?;
        row(f, &self.weighted_avg)
    }
}

/// Predicts every item of `dataset` once, in order, and scores the predictions.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    dataset: &ActivityDataset,
    encoder: &LabelEncoder,
    batch_size: usize,
    mean: [f32; 3],
    device: &B::Device,
) -> Result<ClassificationReport> {
    let mut generator = BatchGenerator::validation(dataset, batch_size, mean)?;
    let batcher = ActivityBatcher::<B>::new(device.clone());
    let passes = generator.batches_per_pass();

    let mut predicted = Vec::new();
    for samples in generator.by_ref().take(passes) {
        let probabilities = model.predict(batcher.batch(samples).images);
        predicted.extend(
            probabilities
                .argmax(1)
                .into_data()
                .iter::<i64>()
                .map(|class| class as usize),
        );
    }

    let truth = dataset.class_indices();
    let report = ClassificationReport::from_predictions(&truth, &predicted, encoder.classes());
    info!(accuracy = report.accuracy, samples = truth.len(), "evaluated test split");

    Ok(report)
}
