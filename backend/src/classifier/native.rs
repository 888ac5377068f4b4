use ndarray::{Array1, Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::preprocess::InputTensor;
use super::{EngineError, InferenceEngine};

pub const WEIGHTS_FORMAT: &str = "plankton-native-v1";
const KERNEL: usize = 3;
const STRIDE: usize = 4;
const DEFAULT_CHANNELS: usize = 16;

/// On-disk weight layout. Tensors are stored flat in row-major order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeWeights {
    pub format: String,
    pub channels: usize,
    pub num_classes: usize,
    pub conv_weights: Vec<f32>,
    pub conv_bias: Vec<f32>,
    pub head_weights: Vec<f32>,
    pub head_bias: Vec<f32>,
}

/// Strided 3×3 convolution, ReLU, global average pool and a linear head.
#[derive(Debug, Clone)]
pub struct NativeNetwork {
    conv: Array4<f32>,
    conv_bias: Array1<f32>,
    head: Array2<f32>,
    head_bias: Array1<f32>,
}

impl NativeNetwork {
    /// Default architecture with uniform fan-in scaled weights drawn from a
    /// seeded generator, so the same seed always yields the same network.
    pub fn random(num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let conv_bound = 1.0 / ((3 * KERNEL * KERNEL) as f32).sqrt();
        let head_bound = 1.0 / (DEFAULT_CHANNELS as f32).sqrt();

        let conv = Array4::from_shape_simple_fn((DEFAULT_CHANNELS, 3, KERNEL, KERNEL), || {
            rng.random_range(-conv_bound..conv_bound)
        });
        let conv_bias =
            Array1::from_shape_simple_fn(DEFAULT_CHANNELS, || rng.random_range(-conv_bound..conv_bound));
        let head = Array2::from_shape_simple_fn((num_classes, DEFAULT_CHANNELS), || {
            rng.random_range(-head_bound..head_bound)
        });
        let head_bias =
            Array1::from_shape_simple_fn(num_classes, || rng.random_range(-head_bound..head_bound));

        Self {
            conv,
            conv_bias,
            head,
            head_bias,
        }
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read(path)?;
        let weights: NativeWeights = serde_json::from_slice(&raw)?;
        Self::from_weights(weights)
    }

    pub fn from_weights(weights: NativeWeights) -> Result<Self, EngineError> {
        if weights.format != WEIGHTS_FORMAT {
            return Err(EngineError::Shape(format!(
                "unknown weight format '{}'",
                weights.format
            )));
        }
        let channels = weights.channels;
        let classes = weights.num_classes;
        if channels == 0 || classes == 0 {
            return Err(EngineError::Shape("empty network".into()));
        }

        let conv = Array4::from_shape_vec((channels, 3, KERNEL, KERNEL), weights.conv_weights)
            .map_err(|e| EngineError::Shape(format!("conv_weights: {e}")))?;
        let conv_bias = Array1::from_shape_vec(channels, weights.conv_bias)
            .map_err(|e| EngineError::Shape(format!("conv_bias: {e}")))?;
        let head = Array2::from_shape_vec((classes, channels), weights.head_weights)
            .map_err(|e| EngineError::Shape(format!("head_weights: {e}")))?;
        let head_bias = Array1::from_shape_vec(classes, weights.head_bias)
            .map_err(|e| EngineError::Shape(format!("head_bias: {e}")))?;

        Ok(Self {
            conv,
            conv_bias,
            head,
            head_bias,
        })
    }

    #[cfg(test)]
    pub fn to_weights(&self) -> NativeWeights {
        NativeWeights {
            format: WEIGHTS_FORMAT.to_string(),
            channels: self.conv_bias.len(),
            num_classes: self.head_bias.len(),
            conv_weights: self.conv.iter().copied().collect(),
            conv_bias: self.conv_bias.to_vec(),
            head_weights: self.head.iter().copied().collect(),
            head_bias: self.head_bias.to_vec(),
        }
    }

    fn pooled_features(&self, input: &InputTensor) -> Result<Array1<f32>, EngineError> {
        let [channels, height, width] = input.shape();
        if channels != 3 || height < KERNEL || width < KERNEL {
            return Err(EngineError::Shape(format!(
                "expected [3, >={KERNEL}, >={KERNEL}] input, got [{channels}, {height}, {width}]"
            )));
        }
        let out_h = (height - KERNEL) / STRIDE + 1;
        let out_w = (width - KERNEL) / STRIDE + 1;
        let cells = (out_h * out_w) as f32;
        let data = &input.data;

        let features = Array1::from_shape_fn(self.conv_bias.len(), |oc| {
            let mut total = 0.0f32;
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = self.conv_bias[oc];
                    for ic in 0..3 {
                        for ky in 0..KERNEL {
                            for kx in 0..KERNEL {
                                acc += self.conv[[oc, ic, ky, kx]]
                                    * data[[ic, oy * STRIDE + ky, ox * STRIDE + kx]];
                            }
                        }
                    }
                    total += acc.max(0.0);
                }
            }
            total / cells
        });
        Ok(features)
    }
}

impl InferenceEngine for NativeNetwork {
    fn forward(&self, input: &InputTensor) -> Result<Vec<f32>, EngineError> {
        let features = self.pooled_features(input)?;
        let logits = self.head.dot(&features) + &self.head_bias;
        Ok(logits.to_vec())
    }

    fn parameter_count(&self) -> usize {
        self.conv.len() + self.conv_bias.len() + self.head.len() + self.head_bias.len()
    }

    fn device(&self) -> String {
        "cpu".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_network() {
        let a = NativeNetwork::random(7, 3).to_weights();
        let b = NativeNetwork::random(7, 3).to_weights();
        let c = NativeNetwork::random(7, 4).to_weights();
        assert_eq!(a.conv_weights, b.conv_weights);
        assert_ne!(a.conv_weights, c.conv_weights);
    }

    #[test]
    fn forward_yields_one_logit_per_class() {
        let net = NativeNetwork::random(5, 1);
        let logits = net.forward(&InputTensor::zeros(32)).unwrap();
        assert_eq!(logits.len(), 5);
        assert!(logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn weights_survive_serialization() {
        let net = NativeNetwork::random(3, 11);
        let json = serde_json::to_vec(&net.to_weights()).unwrap();
        let restored =
            NativeNetwork::from_weights(serde_json::from_slice(&json).unwrap()).unwrap();
        let input = InputTensor::zeros(16);
        assert_eq!(net.forward(&input).unwrap(), restored.forward(&input).unwrap());
        assert_eq!(net.parameter_count(), restored.parameter_count());
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mut weights = NativeNetwork::random(3, 0).to_weights();
        weights.head_bias.pop();
        assert!(matches!(
            NativeNetwork::from_weights(weights),
            Err(EngineError::Shape(_))
        ));
    }

    #[test]
    fn unknown_format_tag_is_rejected() {
        let mut weights = NativeNetwork::random(3, 0).to_weights();
        weights.format = "pytorch-state-dict".into();
        assert!(NativeNetwork::from_weights(weights).is_err());
    }

    #[test]
    fn undersized_input_is_a_shape_error() {
        let net = NativeNetwork::random(2, 0);
        assert!(net.forward(&InputTensor::zeros(2)).is_err());
    }
}
