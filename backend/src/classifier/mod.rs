pub mod native;
pub mod preprocess;
#[cfg(feature = "torch")]
pub mod torch;

use image::DynamicImage;
use shared::{ClassificationResult, ModelInfo, ModelStateKind, ParameterCount};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use crate::config::{ModelConfig, RuntimeKind};
use native::NativeNetwork;
use preprocess::{InputTensor, preprocess};

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Inference runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Model artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),
    #[error("Model artifact {} is corrupt: {reason}", .path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },
    #[error("Prediction failed: {0}")]
    PredictionFailed(String),
}

/// Failures raised inside an inference engine. The classifier decides
/// whether they mean a corrupt artifact or a failed prediction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Shape(String),
    #[error("{0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "torch")]
    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub trait InferenceEngine: Send + Sync {
    /// Raw logits, one per class.
    fn forward(&self, input: &InputTensor) -> Result<Vec<f32>, EngineError>;
    fn parameter_count(&self) -> usize;
    fn device(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableCause {
    /// No usable runtime in this process (disabled or not compiled in).
    NotInstalled,
    /// The runtime is present but the default model could not be built.
    InitFailed,
}

#[derive(Clone)]
pub struct ActiveModel {
    engine: Arc<dyn InferenceEngine>,
    classes: Vec<String>,
}

/// Availability of the classifier. Every public operation dispatches on this
/// one value.
#[derive(Clone)]
pub enum ModelState {
    Unavailable {
        cause: UnavailableCause,
        reason: String,
    },
    Loaded(ActiveModel),
    Ready {
        model: ActiveModel,
        artifact: PathBuf,
    },
}

impl ModelState {
    pub fn kind(&self) -> ModelStateKind {
        match self {
            ModelState::Unavailable { .. } => ModelStateKind::Unavailable,
            ModelState::Loaded(_) => ModelStateKind::Loaded,
            ModelState::Ready { .. } => ModelStateKind::Ready,
        }
    }

    fn active(&self) -> Option<&ActiveModel> {
        match self {
            ModelState::Unavailable { .. } => None,
            ModelState::Loaded(model) | ModelState::Ready { model, .. } => Some(model),
        }
    }
}

enum Runtime {
    Native { seed: u64 },
    #[cfg(feature = "torch")]
    Torch { runtime: torch::TorchRuntime, seed: u64 },
}

impl Runtime {
    fn bring_up(config: &ModelConfig) -> Result<Self, String> {
        match config.runtime {
            RuntimeKind::Native => Ok(Runtime::Native { seed: config.seed }),
            #[cfg(feature = "torch")]
            RuntimeKind::Torch => torch::TorchRuntime::new(config.device)
                .map(|runtime| Runtime::Torch {
                    runtime,
                    seed: config.seed,
                })
                .map_err(|e| e.to_string()),
            #[cfg(not(feature = "torch"))]
            RuntimeKind::Torch => Err("torch support is not compiled into this build".into()),
            RuntimeKind::Disabled => Err("inference runtime disabled by configuration".into()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Runtime::Native { .. } => "native",
            #[cfg(feature = "torch")]
            Runtime::Torch { .. } => "torch",
        }
    }

    fn default_engine(&self, num_classes: usize) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        match self {
            Runtime::Native { seed } => Ok(Arc::new(NativeNetwork::random(num_classes, *seed))),
            #[cfg(feature = "torch")]
            Runtime::Torch { runtime, seed } => {
                Ok(Arc::new(runtime.default_model(num_classes, *seed)?))
            }
        }
    }

    fn load_engine(&self, path: &Path) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        match self {
            Runtime::Native { .. } => Ok(Arc::new(NativeNetwork::load(path)?)),
            #[cfg(feature = "torch")]
            Runtime::Torch { runtime, .. } => Ok(Arc::new(runtime.load(path)?)),
        }
    }
}

/// Process-wide classifier. Built once at startup; the model is swapped
/// only by `load`/`reload`, and in-flight predictions keep the model they
/// started with.
pub struct Classifier {
    runtime: Option<Runtime>,
    default_classes: Vec<String>,
    input_size: u32,
    state: RwLock<Arc<ModelState>>,
    load_lock: Mutex<()>,
}

impl Classifier {
    pub fn initialize(config: &ModelConfig) -> Self {
        let classes = config.classes.clone();
        let runtime = match Runtime::bring_up(config) {
            Ok(runtime) => runtime,
            Err(reason) => {
                log::warn!("Inference runtime unavailable: {}", reason);
                return Self::unavailable(
                    UnavailableCause::NotInstalled,
                    reason,
                    classes,
                    config.input_size,
                );
            }
        };

        let state = match guarded(|| runtime.default_engine(classes.len())) {
            Ok(engine) => {
                log::info!(
                    "{} runtime initialized with default architecture ({} parameters)",
                    runtime.name(),
                    engine.parameter_count()
                );
                ModelState::Loaded(ActiveModel {
                    engine,
                    classes: classes.clone(),
                })
            }
            Err(e) => {
                log::error!("Failed to build default model: {}", e);
                ModelState::Unavailable {
                    cause: UnavailableCause::InitFailed,
                    reason: e.to_string(),
                }
            }
        };

        let classifier = Self {
            runtime: Some(runtime),
            default_classes: classes,
            input_size: config.input_size,
            state: RwLock::new(Arc::new(state)),
            load_lock: Mutex::new(()),
        };

        if let Some(path) = &config.path {
            if let Err(e) = classifier.load(path) {
                log::error!("Startup model load failed, keeping default weights: {}", e);
            }
        }
        classifier
    }

    pub fn unavailable(
        cause: UnavailableCause,
        reason: impl Into<String>,
        classes: Vec<String>,
        input_size: u32,
    ) -> Self {
        Self {
            runtime: None,
            default_classes: classes,
            input_size,
            state: RwLock::new(Arc::new(ModelState::Unavailable {
                cause,
                reason: reason.into(),
            })),
            load_lock: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<ModelState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state_kind(&self) -> ModelStateKind {
        self.snapshot().kind()
    }

    pub fn is_available(&self) -> bool {
        self.state_kind() != ModelStateKind::Unavailable
    }

    pub fn unavailable_cause(&self) -> Option<UnavailableCause> {
        match &*self.snapshot() {
            ModelState::Unavailable { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Fails with `RuntimeUnavailable` when no model can serve predictions.
    pub fn ensure_available(&self) -> Result<(), ClassifierError> {
        match &*self.snapshot() {
            ModelState::Unavailable { reason, .. } => {
                Err(ClassifierError::RuntimeUnavailable(reason.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Whether an inference runtime came up in this process, regardless of
    /// whether a model could be built on it.
    pub fn runtime_present(&self) -> bool {
        self.runtime.is_some()
    }

    /// Active vocabulary, or the configured default when no model is active.
    pub fn classes(&self) -> Vec<String> {
        self.snapshot()
            .active()
            .map(|model| model.classes.clone())
            .unwrap_or_else(|| self.default_classes.clone())
    }

    pub fn predict(&self, image: &DynamicImage) -> Result<ClassificationResult, ClassifierError> {
        let start = Instant::now();
        let state = self.snapshot();
        let model = match &*state {
            ModelState::Unavailable { reason, .. } => {
                return Err(ClassifierError::RuntimeUnavailable(reason.clone()));
            }
            ModelState::Loaded(model) | ModelState::Ready { model, .. } => model,
        };

        let probabilities = guarded(|| {
            let input = preprocess(image, self.input_size);
            model.engine.forward(&input)
        })
        .map_err(|e| ClassifierError::PredictionFailed(e.to_string()))
        .and_then(|logits| distribution(&logits, model.classes.len()))?;

        let (best, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        let all_predictions: BTreeMap<String, f64> = model
            .classes
            .iter()
            .cloned()
            .zip(probabilities.iter().copied())
            .collect();

        Ok(ClassificationResult {
            predicted_class: model.classes[best].clone(),
            confidence,
            all_predictions,
            processing_time: round_ms(start.elapsed().as_secs_f64()),
            success: true,
            error: None,
        })
    }

    /// Loaded → Ready. On any failure the current state is kept as is.
    pub fn load(&self, path: &Path) -> Result<(), ClassifierError> {
        let _serialized = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let ModelState::Unavailable { reason, .. } = &*self.snapshot() {
            return Err(ClassifierError::RuntimeUnavailable(reason.clone()));
        }
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ClassifierError::RuntimeUnavailable("no runtime".into()))?;
        if !path.is_file() {
            return Err(ClassifierError::ArtifactNotFound(path.to_path_buf()));
        }

        let corrupt = |reason: String| ClassifierError::ArtifactCorrupt {
            path: path.to_path_buf(),
            reason,
        };
        let engine = guarded(|| runtime.load_engine(path)).map_err(|e| corrupt(e.to_string()))?;
        let classes = read_companion_classes(path)
            .map_err(|e| corrupt(e.to_string()))?
            .unwrap_or_else(|| self.default_classes.clone());

        let probe = guarded(|| engine.forward(&InputTensor::zeros(self.input_size)))
            .map_err(|e| corrupt(e.to_string()))?;
        if probe.len() != classes.len() {
            return Err(corrupt(format!(
                "model produces {} outputs for {} classes",
                probe.len(),
                classes.len()
            )));
        }
        if probe.iter().any(|v| !v.is_finite()) {
            return Err(corrupt("model produces non-finite outputs".into()));
        }

        let parameters = engine.parameter_count();
        let next = Arc::new(ModelState::Ready {
            model: ActiveModel { engine, classes },
            artifact: path.to_path_buf(),
        });
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
        log::info!(
            "Model loaded from {} ({} parameters)",
            path.display(),
            parameters
        );
        Ok(())
    }

    /// Library entry point for swapping in a new artifact at runtime; the
    /// server itself only loads at startup.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn reload(&self, path: &Path) -> Result<(), ClassifierError> {
        log::info!("Reloading model from {}", path.display());
        self.load(path)
    }

    pub fn model_info(&self) -> ModelInfo {
        let state = self.snapshot();
        let classes = state
            .active()
            .map(|model| model.classes.clone())
            .unwrap_or_else(|| self.default_classes.clone());
        let runtime = self
            .runtime
            .as_ref()
            .map(Runtime::name)
            .unwrap_or("none")
            .to_string();

        let mut info = ModelInfo {
            state: state.kind(),
            model_loaded: false,
            runtime,
            num_classes: classes.len(),
            classes,
            input_shape: [3, self.input_size, self.input_size],
            device: None,
            artifact: None,
            parameters: None,
            message: None,
        };

        match &*state {
            ModelState::Unavailable { reason, .. } => info.message = Some(reason.clone()),
            ModelState::Loaded(model) => {
                info.model_loaded = true;
                info.device = Some(model.engine.device());
                info.parameters = Some(ParameterCount {
                    total: model.engine.parameter_count(),
                });
                info.message = Some("default architecture with untrained weights".into());
            }
            ModelState::Ready { model, artifact } => {
                info.model_loaded = true;
                info.device = Some(model.engine.device());
                info.parameters = Some(ParameterCount {
                    total: model.engine.parameter_count(),
                });
                info.artifact = Some(artifact.display().to_string());
            }
        }
        info
    }

    /// Runtime present, default model failed to build.
    #[cfg(test)]
    pub(crate) fn init_failed(reason: &str, classes: Vec<String>, input_size: u32) -> Self {
        Self {
            runtime: Some(Runtime::Native { seed: 0 }),
            ..Self::unavailable(UnavailableCause::InitFailed, reason, classes, input_size)
        }
    }

    #[cfg(test)]
    pub(crate) fn with_engine(
        engine: Arc<dyn InferenceEngine>,
        classes: Vec<String>,
        input_size: u32,
    ) -> Self {
        Self {
            runtime: Some(Runtime::Native { seed: 0 }),
            default_classes: classes.clone(),
            input_size,
            state: RwLock::new(Arc::new(ModelState::Loaded(ActiveModel { engine, classes }))),
            load_lock: Mutex::new(()),
        }
    }
}

/// `model.json` → `model_classes.json`.
pub fn companion_classes_path(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    artifact.with_file_name(format!("{stem}_classes.json"))
}

fn read_companion_classes(artifact: &Path) -> Result<Option<Vec<String>>, EngineError> {
    let path = companion_classes_path(artifact);
    if !path.is_file() {
        return Ok(None);
    }
    let classes: Vec<String> = serde_json::from_slice(&std::fs::read(&path)?)?;
    if classes.is_empty() {
        return Err(EngineError::Shape(format!("{} lists no classes", path.display())));
    }
    Ok(Some(classes))
}

fn distribution(logits: &[f32], num_classes: usize) -> Result<Vec<f64>, ClassifierError> {
    if logits.len() != num_classes {
        return Err(ClassifierError::PredictionFailed(format!(
            "model produced {} outputs for {} classes",
            logits.len(),
            num_classes
        )));
    }
    if logits.iter().any(|l| !l.is_finite()) {
        return Err(ClassifierError::PredictionFailed(
            "model produced non-finite outputs".into(),
        ));
    }
    let max = logits.iter().fold(f64::NEG_INFINITY, |m, &l| m.max(f64::from(l)));
    let exps: Vec<f64> = logits.iter().map(|&l| (f64::from(l) - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Runs engine code, turning a panic inside the runtime into an error.
fn guarded<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError>,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(EngineError::Runtime(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "inference runtime panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CLASSES;
    use crate::test_support::noise_image;

    fn classes() -> Vec<String> {
        DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect()
    }

    fn native_config() -> ModelConfig {
        ModelConfig {
            input_size: 64,
            ..ModelConfig::default()
        }
    }

    fn write_artifact(dir: &Path, name: &str, num_classes: usize, seed: u64) -> PathBuf {
        let path = dir.join(name);
        let weights = NativeNetwork::random(num_classes, seed).to_weights();
        std::fs::write(&path, serde_json::to_vec(&weights).unwrap()).unwrap();
        path
    }

    struct PanickingEngine;

    impl InferenceEngine for PanickingEngine {
        fn forward(&self, _input: &InputTensor) -> Result<Vec<f32>, EngineError> {
            panic!("kernel exploded")
        }
        fn parameter_count(&self) -> usize {
            0
        }
        fn device(&self) -> String {
            "cpu".into()
        }
    }

    struct NanEngine(usize);

    impl InferenceEngine for NanEngine {
        fn forward(&self, _input: &InputTensor) -> Result<Vec<f32>, EngineError> {
            Ok(vec![f32::NAN; self.0])
        }
        fn parameter_count(&self) -> usize {
            0
        }
        fn device(&self) -> String {
            "cpu".into()
        }
    }

    #[test]
    fn loaded_state_produces_full_distribution() {
        let classifier = Classifier::initialize(&native_config());
        assert_eq!(classifier.state_kind(), ModelStateKind::Loaded);

        let result = classifier.predict(&noise_image(80, 60)).unwrap();
        let total: f64 = result.all_predictions.values().sum();
        assert!((total - 1.0).abs() < 1e-3);
        assert_eq!(result.all_predictions.len(), 7);
        assert!(classes().contains(&result.predicted_class));
        assert_eq!(result.confidence, result.all_predictions[&result.predicted_class]);
        assert!(result.all_predictions.values().all(|p| *p <= result.confidence));
        assert!(result.success);
    }

    #[test]
    fn prediction_is_deterministic() {
        let classifier = Classifier::initialize(&native_config());
        let image = noise_image(100, 100);
        let first = classifier.predict(&image).unwrap();
        let second = classifier.predict(&image).unwrap();
        assert_eq!(first.predicted_class, second.predicted_class);
        assert!((first.confidence - second.confidence).abs() < 1e-6);
    }

    #[test]
    fn unavailable_runtime_fails_fast() {
        let config = ModelConfig {
            runtime: RuntimeKind::Disabled,
            ..native_config()
        };
        let classifier = Classifier::initialize(&config);
        assert!(!classifier.is_available());
        assert_eq!(
            classifier.unavailable_cause(),
            Some(UnavailableCause::NotInstalled)
        );
        assert!(matches!(
            classifier.predict(&noise_image(60, 60)),
            Err(ClassifierError::RuntimeUnavailable(_))
        ));

        let info = classifier.model_info();
        assert_eq!(info.state, ModelStateKind::Unavailable);
        assert!(!info.model_loaded);
        assert_eq!(info.num_classes, 7);
        assert!(info.message.is_some());
        assert_eq!(classifier.classes(), classes());
    }

    #[cfg(not(feature = "torch"))]
    #[test]
    fn torch_without_feature_is_not_installed() {
        let config = ModelConfig {
            runtime: RuntimeKind::Torch,
            ..native_config()
        };
        let classifier = Classifier::initialize(&config);
        assert_eq!(classifier.state_kind(), ModelStateKind::Unavailable);
    }

    #[test]
    fn load_missing_artifact_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Classifier::initialize(&native_config());
        let err = classifier.load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ClassifierError::ArtifactNotFound(_)));
        assert_eq!(classifier.state_kind(), ModelStateKind::Loaded);
    }

    #[test]
    fn load_corrupt_artifact_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, b"{ not weights").unwrap();

        let classifier = Classifier::initialize(&native_config());
        let err = classifier.load(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::ArtifactCorrupt { .. }));
        assert_eq!(classifier.state_kind(), ModelStateKind::Loaded);
        assert!(classifier.model_info().artifact.is_none());
    }

    #[test]
    fn wrong_output_width_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), "model.json", 3, 5);
        let classifier = Classifier::initialize(&native_config());
        assert!(matches!(
            classifier.load(&path),
            Err(ClassifierError::ArtifactCorrupt { .. })
        ));
    }

    #[test]
    fn load_moves_to_ready_with_fixed_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), "model.json", 7, 1234);

        let classifier = Classifier::initialize(&native_config());
        classifier.load(&path).unwrap();
        assert_eq!(classifier.state_kind(), ModelStateKind::Ready);

        let info = classifier.model_info();
        assert!(info.model_loaded);
        assert_eq!(info.artifact, Some(path.display().to_string()));
        assert_eq!(info.input_shape, [3, 64, 64]);
        assert_eq!(info.device.as_deref(), Some("cpu"));

        let image = noise_image(128, 96);
        let a = classifier.predict(&image).unwrap();
        let b = classifier.predict(&image).unwrap();
        assert_eq!(a.all_predictions, b.all_predictions);
    }

    #[test]
    fn companion_vocabulary_replaces_classes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), "tiny.json", 2, 9);
        std::fs::write(
            companion_classes_path(&path),
            serde_json::to_vec(&["Diatom", "Other"]).unwrap(),
        )
        .unwrap();

        let classifier = Classifier::initialize(&native_config());
        classifier.load(&path).unwrap();
        assert_eq!(classifier.classes(), vec!["Diatom", "Other"]);
        let result = classifier.predict(&noise_image(64, 64)).unwrap();
        assert_eq!(result.all_predictions.len(), 2);
    }

    #[test]
    fn panicking_engine_becomes_prediction_failed() {
        let classifier = Classifier::with_engine(Arc::new(PanickingEngine), classes(), 32);
        let err = classifier.predict(&noise_image(60, 60)).unwrap_err();
        match err {
            ClassifierError::PredictionFailed(message) => assert!(message.contains("kernel exploded")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_finite_output_becomes_prediction_failed() {
        let classifier = Classifier::with_engine(Arc::new(NanEngine(7)), classes(), 32);
        assert!(matches!(
            classifier.predict(&noise_image(60, 60)),
            Err(ClassifierError::PredictionFailed(_))
        ));
    }

    #[test]
    fn reload_during_predictions_never_tears() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_artifact(dir.path(), "first.json", 7, 1);
        let second = write_artifact(dir.path(), "second.json", 7, 2);
        let classifier = Classifier::initialize(&native_config());
        let image = noise_image(64, 64);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let result = classifier.predict(&image).unwrap();
                        let total: f64 = result.all_predictions.values().sum();
                        assert!((total - 1.0).abs() < 1e-3);
                    }
                });
            }
            scope.spawn(|| {
                for path in [&first, &second, &first] {
                    classifier.reload(path).unwrap();
                }
            });
        });
        assert_eq!(classifier.state_kind(), ModelStateKind::Ready);
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let probabilities = distribution(&[1000.0, 1000.0, -1000.0], 3).unwrap();
        assert!((probabilities[0] - 0.5).abs() < 1e-9);
        assert!(probabilities[2] < 1e-12);
    }
}
