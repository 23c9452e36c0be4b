//! Local classification of water readings against a kNN exemplar set.
//!
//! The model lives behind a lock so an operator can swap the file and call
//! [`LocalClassifier::reload`] without restarting the sensor branch.

mod model;

pub use model::{Exemplar, KnnModel, ModelFile, Vote, REFERENCE_MODEL_VERSION};

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use chrono::Utc;
use thiserror::Error;

use crate::models::{Classification, ModelError, Reading};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("no classification model is loaded")]
    ModelUnavailable,
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ModelError),
}

pub struct LocalClassifier {
    model_file: PathBuf,
    model: RwLock<Option<Arc<KnnModel>>>,
}

impl LocalClassifier {
    /// Loads the model file, writing the reference set there first if the
    /// file does not exist. A present but unreadable file is an error.
    pub fn load_or_bootstrap(model_file: impl Into<PathBuf>) -> Result<Self, ClassifyError> {
        let model_file = model_file.into();
        if !model_file.exists() {
            log_warn!(
                "Model file {} not found, writing reference exemplar set",
                model_file.display()
            );
            write_model_file(&model_file, &ModelFile::reference())?;
        }

        let model = read_model_file(&model_file)?;
        log_info!(
            "Loaded kNN model {} (k={}) from {}",
            model.version(),
            model.k(),
            model_file.display()
        );

        Ok(Self {
            model_file,
            model: RwLock::new(Some(Arc::new(model))),
        })
    }

    pub fn with_model(model: KnnModel, model_file: impl Into<PathBuf>) -> Self {
        Self {
            model_file: model_file.into(),
            model: RwLock::new(Some(Arc::new(model))),
        }
    }

    pub fn model_file(&self) -> &Path {
        &self.model_file
    }

    pub fn classify(&self, reading: Reading) -> Result<Classification, ClassifyError> {
        let model = self.current().ok_or(ClassifyError::ModelUnavailable)?;
        let vote = model.vote(reading.features());

        Ok(Classification::new(
            reading,
            vote.label,
            vote.confidence,
            model.version(),
            Utc::now(),
        )?)
    }

    /// Re-reads the model file. On failure the previous model stays in place.
    pub fn reload(&self) -> Result<(), ClassifyError> {
        let model = read_model_file(&self.model_file)?;
        log_info!("Reloaded kNN model {}", model.version());
        *self.slot_mut() = Some(Arc::new(model));
        Ok(())
    }

    pub fn unload(&self) {
        *self.slot_mut() = None;
        log_warn!("kNN model unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    pub fn model_version(&self) -> Option<String> {
        self.current().map(|model| model.version().to_string())
    }

    fn current(&self) -> Option<Arc<KnnModel>> {
        let guard = match self.model.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    fn slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<KnnModel>>> {
        match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_model_file(path: &Path) -> Result<KnnModel, ClassifyError> {
    let text = fs::read_to_string(path).map_err(|source| ClassifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ModelFile = serde_json::from_str(&text)
        .map_err(|err| ClassifyError::InvalidModel(format!("{}: {err}", path.display())))?;
    KnnModel::from_file(file)
}

fn write_model_file(path: &Path, file: &ModelFile) -> Result<(), ClassifyError> {
    let io_err = |source| ClassifyError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(file)
        .map_err(|err| ClassifyError::InvalidModel(err.to_string()))?;
    fs::write(path, json).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> Reading {
        Reading::new("raspi-01", Utc::now(), 25.8, 7.0, 410.0).unwrap()
    }

    #[test]
    fn missing_file_bootstraps_reference_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("knn_model.json");

        let classifier = LocalClassifier::load_or_bootstrap(&path).unwrap();

        assert!(path.exists());
        assert_eq!(
            classifier.model_version().as_deref(),
            Some(REFERENCE_MODEL_VERSION)
        );
        let written: ModelFile =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, ModelFile::reference());
    }

    #[test]
    fn corrupt_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knn_model.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            LocalClassifier::load_or_bootstrap(&path),
            Err(ClassifyError::InvalidModel(_))
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn classification_carries_model_version_and_reading() {
        let dir = tempfile::tempdir().unwrap();
        let classifier =
            LocalClassifier::load_or_bootstrap(dir.path().join("knn_model.json")).unwrap();

        let reading = reading();
        let captured_at = reading.captured_at();
        let classification = classifier.classify(reading).unwrap();

        assert_eq!(classification.label(), "normal");
        assert_eq!(classification.model_version(), REFERENCE_MODEL_VERSION);
        assert_eq!(classification.captured_at(), captured_at);
        assert!(classification.analyzed_at() >= captured_at);
    }

    #[test]
    fn unloaded_model_is_unavailable_until_reload() {
        let dir = tempfile::tempdir().unwrap();
        let classifier =
            LocalClassifier::load_or_bootstrap(dir.path().join("knn_model.json")).unwrap();

        classifier.unload();
        assert!(matches!(
            classifier.classify(reading()),
            Err(ClassifyError::ModelUnavailable)
        ));

        classifier.reload().unwrap();
        assert!(classifier.classify(reading()).is_ok());
    }

    #[test]
    fn failed_reload_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knn_model.json");
        let classifier = LocalClassifier::load_or_bootstrap(&path).unwrap();

        fs::write(&path, r#"{"version":"v2","k":5,"exemplars":[]}"#).unwrap();
        assert!(classifier.reload().is_err());
        assert_eq!(
            classifier.model_version().as_deref(),
            Some(REFERENCE_MODEL_VERSION)
        );
    }
}
