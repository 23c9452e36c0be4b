//! kNN exemplar set and its on-disk JSON form.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use super::ClassifyError;

pub const REFERENCE_MODEL_VERSION: &str = "knn-reference-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub temperature: f64,
    pub ph: f64,
    pub tds: f64,
    pub label: String,
}

impl Exemplar {
    fn features(&self) -> [f64; 3] {
        [self.temperature, self.ph, self.tds]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub version: String,
    pub k: usize,
    #[serde(default)]
    pub standardize: bool,
    pub exemplars: Vec<Exemplar>,
}

impl ModelFile {
    /// Four-point set used when no model has been provisioned on the device.
    pub fn reference() -> Self {
        let exemplar = |temperature, ph, tds, label: &str| Exemplar {
            temperature,
            ph,
            tds,
            label: label.to_string(),
        };

        Self {
            version: REFERENCE_MODEL_VERSION.to_string(),
            k: 3,
            standardize: true,
            exemplars: vec![
                exemplar(22.0, 6.8, 300.0, "low"),
                exemplar(25.0, 7.0, 350.0, "normal"),
                exemplar(28.0, 7.4, 400.0, "normal"),
                exemplar(30.0, 7.8, 450.0, "high"),
            ],
        }
    }
}

/// Per-feature z-score parameters fitted on the exemplar set.
#[derive(Debug, Clone, PartialEq)]
struct Scaler {
    mean: [f64; 3],
    scale: [f64; 3],
}

impl Scaler {
    fn fit(points: &[[f64; 3]]) -> Self {
        let n = points.len() as f64;
        let mut mean = [0.0; 3];
        let mut scale = [0.0; 3];

        for i in 0..3 {
            mean[i] = points.iter().map(|p| p[i]).sum::<f64>() / n;
            let variance = points.iter().map(|p| (p[i] - mean[i]).powi(2)).sum::<f64>() / n;
            let deviation = variance.sqrt();
            scale[i] = if deviation > 0.0 { deviation } else { 1.0 };
        }

        Self { mean, scale }
    }

    fn transform(&self, point: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for i in 0..3 {
            out[i] = (point[i] - self.mean[i]) / self.scale[i];
        }
        out
    }
}

/// Winning label of a neighbor vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct KnnModel {
    version: String,
    k: usize,
    scaler: Option<Scaler>,
    points: Vec<[f64; 3]>,
    labels: Vec<String>,
}

impl KnnModel {
    pub fn from_file(file: ModelFile) -> Result<Self, ClassifyError> {
        let invalid = |reason: String| ClassifyError::InvalidModel(reason);

        if file.version.trim().is_empty() {
            return Err(invalid("model version is empty".into()));
        }
        if file.k == 0 {
            return Err(invalid("k must be at least 1".into()));
        }
        if file.exemplars.len() < file.k {
            return Err(invalid(format!(
                "k={} but only {} exemplars",
                file.k,
                file.exemplars.len()
            )));
        }
        for (index, exemplar) in file.exemplars.iter().enumerate() {
            if exemplar.label.trim().is_empty() {
                return Err(invalid(format!("exemplar {index} has an empty label")));
            }
            if exemplar.features().iter().any(|v| !v.is_finite()) {
                return Err(invalid(format!("exemplar {index} has a non-finite feature")));
            }
        }

        let raw: Vec<[f64; 3]> = file.exemplars.iter().map(Exemplar::features).collect();
        let (scaler, points) = if file.standardize {
            let scaler = Scaler::fit(&raw);
            let points = raw.iter().map(|p| scaler.transform(*p)).collect();
            (Some(scaler), points)
        } else {
            (None, raw)
        };

        Ok(Self {
            version: file.version,
            k: file.k,
            scaler,
            points,
            labels: file.exemplars.into_iter().map(|e| e.label).collect(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Majority vote of the k nearest exemplars.
    ///
    /// Equal distances keep exemplar order. A tied vote goes to the label
    /// with the lowest mean neighbor distance, then to the smallest label.
    pub fn vote(&self, features: [f64; 3]) -> Vote {
        let query = match &self.scaler {
            Some(scaler) => scaler.transform(features),
            None => features,
        };

        let mut neighbors: Vec<(f64, usize)> = self
            .points
            .iter()
            .enumerate()
            .map(|(index, point)| (euclidean(&query, point), index))
            .collect();
        neighbors.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        neighbors.truncate(self.k);

        // label -> (count, distance sum)
        let mut tally: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
        for (distance, index) in &neighbors {
            let entry = tally.entry(self.labels[*index].as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += distance;
        }

        let (label, (count, _)) = tally
            .into_iter()
            .min_by(|(label_a, (count_a, sum_a)), (label_b, (count_b, sum_b))| {
                count_b
                    .cmp(count_a)
                    .then_with(|| {
                        let mean_a = sum_a / *count_a as f64;
                        let mean_b = sum_b / *count_b as f64;
                        mean_a.partial_cmp(&mean_b).unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| label_a.cmp(label_b))
            })
            .unwrap_or(("", (0, 0.0)));

        Vote {
            label: label.to_string(),
            confidence: count as f64 / self.k as f64,
        }
    }
}

fn euclidean(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(k: usize, standardize: bool, exemplars: &[(f64, f64, f64, &str)]) -> ModelFile {
        ModelFile {
            version: "test-1".into(),
            k,
            standardize,
            exemplars: exemplars
                .iter()
                .map(|(temperature, ph, tds, label)| Exemplar {
                    temperature: *temperature,
                    ph: *ph,
                    tds: *tds,
                    label: label.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn three_normal_neighbors_give_full_confidence() {
        let model = KnnModel::from_file(file(
            3,
            false,
            &[
                (25.0, 7.0, 400.0, "normal"),
                (26.0, 7.1, 420.0, "normal"),
                (25.5, 6.9, 405.0, "normal"),
                (18.0, 6.0, 150.0, "low"),
                (32.0, 8.2, 800.0, "high"),
            ],
        ))
        .unwrap();

        let vote = model.vote([25.8, 7.0, 410.0]);
        assert_eq!(vote.label, "normal");
        assert_eq!(vote.confidence, 1.0);
    }

    #[test]
    fn reference_model_votes_normal_by_majority() {
        let model = KnnModel::from_file(ModelFile::reference()).unwrap();
        let vote = model.vote([25.8, 7.0, 410.0]);
        assert_eq!(vote.label, "normal");
        assert!((vote.confidence - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn split_vote_goes_to_closer_label() {
        let model = KnnModel::from_file(file(
            2,
            false,
            &[(10.0, 7.0, 100.0, "far"), (11.0, 7.0, 100.0, "near")],
        ))
        .unwrap();

        let vote = model.vote([10.9, 7.0, 100.0]);
        assert_eq!(vote.label, "near");
        assert_eq!(vote.confidence, 0.5);
    }

    #[test]
    fn exact_tie_goes_to_smallest_label() {
        let model = KnnModel::from_file(file(
            2,
            false,
            &[(9.0, 7.0, 100.0, "zeta"), (11.0, 7.0, 100.0, "alpha")],
        ))
        .unwrap();

        assert_eq!(model.vote([10.0, 7.0, 100.0]).label, "alpha");
    }

    #[test]
    fn constant_feature_does_not_divide_by_zero() {
        let model = KnnModel::from_file(file(
            1,
            true,
            &[(25.0, 7.0, 300.0, "a"), (25.0, 7.0, 500.0, "b")],
        ))
        .unwrap();

        let vote = model.vote([25.0, 7.0, 480.0]);
        assert_eq!(vote.label, "b");
    }

    #[test]
    fn votes_stay_in_label_set_with_unit_confidence() {
        let model = KnnModel::from_file(ModelFile::reference()).unwrap();
        let labels: Vec<&str> = model.labels().collect();

        for temperature in [-5.0, 10.0, 22.0, 26.0, 40.0, 80.0] {
            for ph in [0.0, 6.5, 7.0, 7.6, 14.0] {
                for tds in [0.0, 320.0, 410.0, 2000.0, 5000.0] {
                    let vote = model.vote([temperature, ph, tds]);
                    assert!(labels.contains(&vote.label.as_str()));
                    assert!((0.0..=1.0).contains(&vote.confidence));
                }
            }
        }
    }

    #[test]
    fn invalid_files_are_rejected() {
        assert!(KnnModel::from_file(file(0, false, &[(1.0, 1.0, 1.0, "a")])).is_err());
        assert!(KnnModel::from_file(file(2, false, &[(1.0, 1.0, 1.0, "a")])).is_err());
        assert!(KnnModel::from_file(file(1, false, &[(f64::NAN, 1.0, 1.0, "a")])).is_err());
        assert!(KnnModel::from_file(file(1, false, &[(1.0, 1.0, 1.0, " ")])).is_err());
    }
}
