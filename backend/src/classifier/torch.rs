use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tch::nn::{self, ModuleT};
use tch::{CModule, Device, Kind, Tensor};

use super::preprocess::InputTensor;
use super::{EngineError, InferenceEngine};
use crate::config::DevicePreference;

#[derive(Debug, Clone, Copy)]
pub struct TorchRuntime {
    device: Device,
}

impl TorchRuntime {
    pub fn new(preference: DevicePreference) -> Result<Self, EngineError> {
        let device = match preference {
            DevicePreference::Auto => Device::cuda_if_available(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda if tch::Cuda::is_available() => Device::Cuda(0),
            DevicePreference::Cuda => {
                return Err(EngineError::Runtime(
                    "CUDA requested but no device is available".into(),
                ));
            }
        };
        Ok(Self { device })
    }

    /// Untrained conv net used until a TorchScript artifact is loaded.
    pub fn default_model(&self, num_classes: usize, seed: u64) -> Result<TorchModel, EngineError> {
        tch::manual_seed(seed as i64);
        let vs = nn::VarStore::new(self.device);
        let root = vs.root();
        let net = nn::seq_t()
            .add(nn::conv2d(
                &root / "features",
                3,
                16,
                3,
                nn::ConvConfig {
                    stride: 4,
                    ..Default::default()
                },
            ))
            .add_fn(|xs| xs.relu().adaptive_avg_pool2d([1, 1]).flatten(1, -1))
            .add(nn::linear(
                &root / "classifier",
                16,
                num_classes as i64,
                Default::default(),
            ));
        let parameters = vs.trainable_variables().iter().map(Tensor::numel).sum();
        Ok(TorchModel {
            module: Mutex::new(TorchModule::Default { _vs: vs, net }),
            device: self.device,
            parameters,
        })
    }

    pub fn load(&self, path: &Path) -> Result<TorchModel, EngineError> {
        let mut module = CModule::load_on_device(path, self.device)?;
        module.set_eval();
        let parameters = module
            .named_parameters()?
            .iter()
            .map(|(_, tensor)| tensor.numel())
            .sum();
        Ok(TorchModel {
            module: Mutex::new(TorchModule::Script(module)),
            device: self.device,
            parameters,
        })
    }
}

enum TorchModule {
    Script(CModule),
    Default { _vs: nn::VarStore, net: nn::SequentialT },
}

pub struct TorchModel {
    module: Mutex<TorchModule>,
    device: Device,
    parameters: usize,
}

impl InferenceEngine for TorchModel {
    fn forward(&self, input: &InputTensor) -> Result<Vec<f32>, EngineError> {
        let [c, h, w] = input.shape();
        let tensor = Tensor::from_slice(&input.to_vec())
            .view([1, c as i64, h as i64, w as i64])
            .to_device(self.device);

        let module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        let output = tch::no_grad(|| match &*module {
            TorchModule::Script(script) => script.forward_ts(&[tensor]),
            TorchModule::Default { net, .. } => Ok(net.forward_t(&tensor, false)),
        })?;

        let output_flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut output_vec, num_elements);
        Ok(output_vec)
    }

    fn parameter_count(&self) -> usize {
        self.parameters
    }

    fn device(&self) -> String {
        format!("{:?}", self.device).to_lowercase()
    }
}
