//! `ThreatClassifier`: sanitises a feature vector, applies a scaler, scores
//! it against a loaded artefact, and threshold-tests the result.
//!
//! The pyo3/joblib bridge (`Python::with_gil`, `joblib.load`,
//! `scaler.transform` then `model.predict_proba`) takes a fixed 20-element
//! positional `ndarray`/`numpy` array rather than a column-named `DataFrame`,
//! since the classifier contract here is positional, not column-named.

use std::sync::Arc;

use numpy::{IntoPyArray, PyArray2, PyArrayMethods};
use pyo3::prelude::*;
use pyo3::types::PyAny;
use wide::f64x4;

use crate::error::{ModelErrorKind, Result, SynwatchError};
use crate::features::FEATURE_COUNT;

pub const MIN_FEATURE: f64 = -1e9;
pub const MAX_FEATURE: f64 = 1e9;
pub const MAX_ARRAY_SIZE: usize = 1_000_000;
pub const MAX_ARTEFACT_BYTES: u64 = 100 * 1024 * 1024;

/// Describes whether scoring is currently possible, and if not, why. The
/// coordinator's `start()` gates on `can_score()` before opening a capture
/// session.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Ready,
    NotLoaded,
    Failed(String),
}

impl LoadStatus {
    pub fn can_score(&self) -> bool {
        matches!(self, LoadStatus::Ready)
    }
}

/// Narrow capability interface for a classifier backend: `predict_proba` and
/// an optional `transform`, validated at load time against the declared
/// arity rather than relying on runtime reflection or duck typing.
pub trait ModelBackend: Send + Sync {
    /// Returns the positive-class probability for one row of `arity` features.
    fn predict_proba(&self, features: &[f64]) -> std::result::Result<f64, String>;
    fn arity(&self) -> usize;
}

pub trait ScalerBackend: Send + Sync {
    fn transform(&self, features: &[f64]) -> std::result::Result<Vec<f64>, String>;
}

/// Loads a classifier + optional scaler pair through `joblib` via pyo3,
/// using a `Python::with_gil` + `joblib.import` bridge.
pub struct ModelLoader;

impl ModelLoader {
    /// Deserialises the classifier (and optional scaler) at the given paths,
    /// validating declared input arity (must be 20) and on-disk size (max
    /// 100 MB) before binding anything to a `ThreatClassifier`.
    pub fn load(
        model_path: &str,
        scaler_path: Option<&str>,
        declared_arity: usize,
    ) -> Result<(Arc<dyn ModelBackend>, Option<Arc<dyn ScalerBackend>>)> {
        if declared_arity != FEATURE_COUNT {
            return Err(SynwatchError::Model(ModelErrorKind::ShapeMismatch {
                expected: FEATURE_COUNT,
                found: declared_arity,
            }));
        }

        for path in std::iter::once(model_path).chain(scaler_path) {
            let metadata = std::fs::metadata(path)
                .map_err(|e| SynwatchError::Model(ModelErrorKind::BackendError(e.to_string())))?;
            if metadata.len() > MAX_ARTEFACT_BYTES {
                return Err(SynwatchError::Model(ModelErrorKind::BackendError(format!(
                    "artefact {} exceeds the 100 MB size limit",
                    path
                ))));
            }
        }

        let model_path_owned = model_path.to_string();
        let scaler_path_owned = scaler_path.map(|p| p.to_string());

        Python::with_gil(|py| -> Result<_> {
            let joblib = py
                .import("joblib")
                .map_err(|e| SynwatchError::Model(ModelErrorKind::BackendError(e.to_string())))?;
            let model_obj: PyObject = joblib
                .call_method1("load", (model_path_owned.as_str(),))
                .map_err(|e| SynwatchError::Model(ModelErrorKind::BackendError(e.to_string())))?
                .into();

            let scaler_obj: Option<PyObject> = match &scaler_path_owned {
                Some(path) => Some(
                    joblib
                        .call_method1("load", (path.as_str(),))
                        .map_err(|e| {
                            SynwatchError::Model(ModelErrorKind::BackendError(e.to_string()))
                        })?
                        .into(),
                ),
                None => None,
            };

            let backend: Arc<dyn ModelBackend> = Arc::new(JoblibModel {
                model: model_obj,
                arity: FEATURE_COUNT,
            });
            let scaler: Option<Arc<dyn ScalerBackend>> = scaler_obj
                .map(|obj| Arc::new(JoblibScaler { scaler: obj }) as Arc<dyn ScalerBackend>);

            Ok((backend, scaler))
        })
    }
}

/// A `joblib`-deserialised scikit-learn-style classifier exposing
/// `predict_proba(matrix) -> matrix` with two columns summing to 1.0 per
/// row; column 1 is the positive class.
struct JoblibModel {
    model: PyObject,
    arity: usize,
}

impl ModelBackend for JoblibModel {
    fn predict_proba(&self, features: &[f64]) -> std::result::Result<f64, String> {
        Python::with_gil(|py| {
            let array = ndarray::Array2::from_shape_vec((1, features.len()), features.to_vec())
                .map_err(|e| e.to_string())?;
            let py_array: Bound<'_, PyArray2<f64>> = array.into_pyarray(py);
            let result = self
                .model
                .call_method1(py, "predict_proba", (py_array,))
                .map_err(|e| e.to_string())?;
            let bound: Bound<'_, PyAny> = result.into_bound(py);
            let rows: Vec<Vec<f64>> = bound.extract().map_err(|e| e.to_string())?;
            rows.first()
                .and_then(|row| row.get(1))
                .copied()
                .ok_or_else(|| "predict_proba returned no positive-class column".to_string())
        })
    }

    fn arity(&self) -> usize {
        self.arity
    }
}

struct JoblibScaler {
    scaler: PyObject,
}

impl ScalerBackend for JoblibScaler {
    fn transform(&self, features: &[f64]) -> std::result::Result<Vec<f64>, String> {
        Python::with_gil(|py| {
            let array = ndarray::Array2::from_shape_vec((1, features.len()), features.to_vec())
                .map_err(|e| e.to_string())?;
            let py_array: Bound<'_, PyArray2<f64>> = array.into_pyarray(py);
            let result = self
                .scaler
                .call_method1(py, "transform", (py_array,))
                .map_err(|e| e.to_string())?;
            let bound: Bound<'_, PyAny> = result.into_bound(py);
            let rows: Vec<Vec<f64>> = bound.extract().map_err(|e| e.to_string())?;
            rows.into_iter()
                .next()
                .ok_or_else(|| "scaler transform returned no rows".to_string())
        })
    }
}

/// A fixed-probability backend used by `RecoveryPolicy`'s `ModelLoadFailed`
/// fallback and by tests exercising the coordinator without pyo3/joblib in
/// the loop.
pub struct ConstantModel {
    pub probability: f64,
}

impl ModelBackend for ConstantModel {
    fn predict_proba(&self, _features: &[f64]) -> std::result::Result<f64, String> {
        Ok(self.probability)
    }

    fn arity(&self) -> usize {
        FEATURE_COUNT
    }
}

/// Per-instance counters the classifier keeps alongside scoring, surfaced for
/// diagnostics but not part of `DetectionStatistics`.
#[derive(Debug, Default)]
struct ClassifierCounters {
    scaler_fallbacks: std::sync::atomic::AtomicU64,
    error_count: std::sync::atomic::AtomicU64,
}

/// Wraps a loaded artefact with a defensive sanitisation pipeline. Immutable
/// after construction; `score` is thread-safe and called concurrently by
/// every worker thread.
pub struct ThreatClassifier {
    backend: Option<Arc<dyn ModelBackend>>,
    scaler: Option<Arc<dyn ScalerBackend>>,
    threshold: f64,
    load_status: LoadStatus,
    counters: ClassifierCounters,
}

impl ThreatClassifier {
    pub fn unloaded() -> Self {
        ThreatClassifier {
            backend: None,
            scaler: None,
            threshold: 0.7,
            load_status: LoadStatus::NotLoaded,
            counters: ClassifierCounters::default(),
        }
    }

    pub fn new(
        backend: Arc<dyn ModelBackend>,
        scaler: Option<Arc<dyn ScalerBackend>>,
        threshold: f64,
    ) -> Self {
        ThreatClassifier {
            backend: Some(backend),
            scaler,
            threshold,
            load_status: LoadStatus::Ready,
            counters: ClassifierCounters::default(),
        }
    }

    pub fn failed(reason: String) -> Self {
        ThreatClassifier {
            backend: None,
            scaler: None,
            threshold: 0.7,
            load_status: LoadStatus::Failed(reason),
            counters: ClassifierCounters::default(),
        }
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn scaler_fallbacks(&self) -> u64 {
        self.counters
            .scaler_fallbacks
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.counters
            .error_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Sanitises, scales, and scores `vector`. Never panics and never
    /// propagates a backend failure past this call: a `BackendError` is
    /// absorbed into `(0.0, false)` plus `error_count`.
    pub fn score(&self, vector: &[f64]) -> Result<(f64, bool)> {
        let backend = match &self.backend {
            Some(b) => b,
            None => return Err(SynwatchError::Model(ModelErrorKind::NotLoaded)),
        };

        if vector.len() > MAX_ARRAY_SIZE {
            return Err(SynwatchError::Model(ModelErrorKind::BackendError(
                "InputTooLarge".to_string(),
            )));
        }
        if vector.len() != backend.arity() {
            return Err(SynwatchError::Model(ModelErrorKind::ShapeMismatch {
                expected: backend.arity(),
                found: vector.len(),
            }));
        }

        let sanitised = sanitise_simd(vector);

        let scored = match &self.scaler {
            Some(scaler) => match scaler.transform(&sanitised) {
                Ok(scaled) => scaled,
                Err(_) => {
                    self.counters
                        .scaler_fallbacks
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    sanitised
                }
            },
            None => sanitised,
        };

        match backend.predict_proba(&scored) {
            Ok(probability) => {
                let probability = if probability.is_finite() {
                    probability.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let is_threat = probability >= self.threshold;
                Ok((probability, is_threat))
            }
            Err(_) => {
                self.counters
                    .error_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok((0.0, false))
            }
        }
    }
}

/// Replaces non-finite values with 0.0 and clamps every element to
/// `[MIN_FEATURE, MAX_FEATURE]`, processing four lanes at a time with a
/// portable SIMD type and falling back to scalar for the remainder.
/// Purely an implementation detail: observably identical to scalar
/// sanitisation.
fn sanitise_simd(vector: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0_f64; vector.len()];
    let chunks = vector.len() / 4;

    let min_lane = f64x4::splat(MIN_FEATURE);
    let max_lane = f64x4::splat(MAX_FEATURE);

    for i in 0..chunks {
        let base = i * 4;
        let raw = [
            vector[base],
            vector[base + 1],
            vector[base + 2],
            vector[base + 3],
        ];
        let finite = raw.map(|v| if v.is_finite() { v } else { 0.0 });
        let lane = f64x4::new(finite);
        let clamped = lane.max(min_lane).min(max_lane);
        let arr = clamped.to_array();
        out[base..base + 4].copy_from_slice(&arr);
    }

    for i in (chunks * 4)..vector.len() {
        let v = if vector[i].is_finite() { vector[i] } else { 0.0 };
        out[i] = v.clamp(MIN_FEATURE, MAX_FEATURE);
    }

    out
}
