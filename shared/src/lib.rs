use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Base64Request {
    #[serde(default)]
    pub image: Option<String>,
}

/// Outcome of one inference call.
///
/// `all_predictions` covers every class in the vocabulary and sums to 1
/// within floating tolerance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassificationResult {
    pub predicted_class: String,
    pub confidence: f64,
    pub all_predictions: BTreeMap<String, f64>,
    pub processing_time: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassificationResult {
    pub fn failure(error: impl Into<String>, processing_time: f64) -> Self {
        Self {
            predicted_class: String::new(),
            confidence: 0.0,
            all_predictions: BTreeMap::new(),
            processing_time,
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PredictResponse {
    pub success: bool,
    pub filename: String,
    pub prediction: ClassificationResult,
    pub processing_time: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Base64PredictResponse {
    pub success: bool,
    pub prediction: ClassificationResult,
    pub processing_time: f64,
    pub image_info: ImageInfo,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelStateKind {
    Unavailable,
    Loaded,
    Ready,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterCount {
    pub total: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub state: ModelStateKind,
    pub model_loaded: bool,
    pub runtime: String,
    pub classes: Vec<String>,
    pub num_classes: usize,
    pub input_shape: [u32; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParameterCount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Limited,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SizeLimits {
    pub min: String,
    pub max: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerInfo {
    pub server_time: String,
    pub upload_folder: String,
    pub max_file_size: String,
    pub allowed_extensions: Vec<String>,
    pub image_size_limits: SizeLimits,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StatusResponse {
    pub status: ServiceStatus,
    pub message: String,
    pub model_info: ModelInfo,
    pub server_info: ServerInfo,
    pub pytorch_available: bool,
    pub endpoints: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClassesResponse {
    pub classes: Vec<String>,
    pub num_classes: usize,
    pub pytorch_available: bool,
    pub classifier_initialized: bool,
}
