use ndarray::Array3;
use std::path::Path;
use tch::{CModule, Device, Kind, TchError, Tensor};

use crate::config::{DeviceConfig, ModelConfig, ModelOutput, SaliencyLayerConfig, TensorLayout};
use crate::error::PipelineError;
use crate::pipeline::preprocess::InputTensor;

const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;
const PROBABILITY_BOUND_TOLERANCE: f32 = 1e-6;
const MIN_LOG_PROBABILITY_INPUT: f64 = 1e-12;

/// A classifier split at the layer Grad-CAM inspects.
///
/// `features` maps a `[1, 3, H, W]` (or NHWC) input to that layer's
/// activations `[1, C, h, w]`; `head` maps activations to class scores
/// `[1, N]`. Implementations must not hold mutable state.
pub trait Network: Send + Sync {
    fn features(&self, input: &Tensor) -> Result<Tensor, TchError>;
    fn head(&self, activations: &Tensor) -> Result<Tensor, TchError>;
}

/// TorchScript artifact exporting the two halves as named methods.
pub struct TorchScriptNetwork {
    module: CModule,
    features_method: String,
    head_method: String,
}

impl TorchScriptNetwork {
    pub fn load(
        path: &Path,
        device: Device,
        layer: &SaliencyLayerConfig,
    ) -> Result<Self, PipelineError> {
        let mut module = CModule::load_on_device(path, device).map_err(|e| {
            PipelineError::ModelUnavailable(format!("failed to load {}: {}", path.display(), e))
        })?;
        module.set_eval();

        // Gradients must only flow into per-request activations, never into
        // the shared weights.
        let parameters = module
            .named_parameters()
            .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))?;
        for (_, parameter) in &parameters {
            let _ = parameter.set_requires_grad(false);
        }
        log::info!(
            "Loaded TorchScript model from {} ({} parameter tensors frozen)",
            path.display(),
            parameters.len()
        );

        Ok(Self {
            module,
            features_method: layer.features_method.clone(),
            head_method: layer.head_method.clone(),
        })
    }
}

impl Network for TorchScriptNetwork {
    fn features(&self, input: &Tensor) -> Result<Tensor, TchError> {
        self.module.method_ts(&self.features_method, &[input])
    }

    fn head(&self, activations: &Tensor) -> Result<Tensor, TchError> {
        self.module.method_ts(&self.head_method, &[activations])
    }
}

/// Per-class scores in class-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVector(Vec<f32>);

impl ProbabilityVector {
    pub fn new(values: Vec<f32>, expected_len: usize) -> Result<Self, PipelineError> {
        if values.len() != expected_len {
            return Err(PipelineError::Internal(format!(
                "model returned {} scores, expected {}",
                values.len(),
                expected_len
            )));
        }
        if values.iter().any(|p| {
            !p.is_finite()
                || *p < -PROBABILITY_BOUND_TOLERANCE
                || *p > 1.0 + PROBABILITY_BOUND_TOLERANCE
        }) {
            return Err(PipelineError::Internal(format!(
                "model returned out-of-range probabilities: {:?}",
                values
            )));
        }
        let sum: f32 = values.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
            return Err(PipelineError::Internal(format!(
                "probabilities sum to {}, expected 1",
                sum
            )));
        }
        Ok(Self(values.into_iter().map(|p| p.clamp(0.0, 1.0)).collect()))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Index of the highest probability; the lowest index wins a tie.
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, p) in self.0.iter().enumerate() {
            if *p > self.0[best] {
                best = i;
            }
        }
        best
    }

    pub fn top(&self) -> f32 {
        self.0.get(self.argmax()).copied().unwrap_or(0.0)
    }
}

/// Activations of the target layer and the gradient of one class score
/// with respect to them, both `[C, h, w]` and batch dimension dropped.
#[derive(Debug, Clone)]
pub struct ActivationGradients {
    pub activations: Array3<f32>,
    pub gradients: Option<Array3<f32>>,
}

pub struct InferenceEngine {
    network: Box<dyn Network>,
    device: Device,
    layout: TensorLayout,
    output: ModelOutput,
    num_classes: usize,
    version: String,
}

impl InferenceEngine {
    /// Loads the TorchScript artifact named in the config.
    pub fn load(config: &ModelConfig, num_classes: usize) -> Result<Self, PipelineError> {
        if !config.path.exists() {
            return Err(PipelineError::ModelUnavailable(format!(
                "model artifact not found at {}",
                config.path.display()
            )));
        }
        let device = match config.device {
            DeviceConfig::Auto => Device::cuda_if_available(),
            DeviceConfig::Cpu => Device::Cpu,
            DeviceConfig::Cuda => Device::Cuda(0),
        };
        log::info!(
            "Loading model {} ({}) on {:?}",
            config.version,
            config.architecture,
            device
        );
        let network = TorchScriptNetwork::load(&config.path, device, &config.saliency_layer)?;
        Ok(Self::with_network(
            Box::new(network),
            device,
            config,
            num_classes,
        ))
    }

    pub fn with_network(
        network: Box<dyn Network>,
        device: Device,
        config: &ModelConfig,
        num_classes: usize,
    ) -> Self {
        Self {
            network,
            device,
            layout: config.layout,
            output: config.output,
            num_classes,
            version: config.version.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Runs a forward and a gradient pass on a blank input so a broken
    /// artifact is caught at startup rather than on the first request.
    pub fn warm_up(&self, input_size: usize) -> Result<(), PipelineError> {
        let blank = InputTensor::zeros(input_size);
        let probabilities = self
            .infer(&blank)
            .map_err(|e| PipelineError::ModelUnavailable(format!("warm-up inference: {}", e)))?;
        self.activation_gradients(&blank, probabilities.argmax())
            .map_err(|e| PipelineError::ModelUnavailable(format!("warm-up saliency: {}", e)))?;
        log::info!(
            "Model {} warmed up ({} classes)",
            self.version,
            self.num_classes
        );
        Ok(())
    }

    pub fn infer(&self, input: &InputTensor) -> Result<ProbabilityVector, PipelineError> {
        let x = self.to_model_input(input)?;
        let scores = tch::no_grad(|| -> Result<Tensor, TchError> {
            let activations = self.network.features(&x)?;
            self.network.head(&activations)
        })?;

        let probabilities = match self.output {
            ModelOutput::Logits => scores.f_softmax(-1, Kind::Float)?,
            ModelOutput::Probabilities => scores,
        };
        let values = tensor_to_vec(&probabilities)?;
        ProbabilityVector::new(values, self.num_classes)
    }

    /// Grad-CAM inputs for `class_index`. Each call builds its own autograd
    /// graph, so concurrent calls share nothing but the frozen weights.
    pub fn activation_gradients(
        &self,
        input: &InputTensor,
        class_index: usize,
    ) -> Result<ActivationGradients, PipelineError> {
        if class_index >= self.num_classes {
            return Err(PipelineError::Internal(format!(
                "class index {} out of range",
                class_index
            )));
        }
        let x = self.to_model_input(input)?;

        let activations = tch::no_grad(|| self.network.features(&x))?
            .detach()
            .set_requires_grad(true);
        let scores = match self.output {
            ModelOutput::Logits => self.network.head(&activations)?,
            // Differentiate log-probabilities so saturated softmax outputs
            // still give a usable gradient.
            ModelOutput::Probabilities => self
                .network
                .head(&activations)?
                .f_clamp_min(MIN_LOG_PROBABILITY_INPUT)?
                .f_log()?,
        };
        let target = scores
            .f_select(1, class_index as i64)?
            .f_sum(Kind::Float)?;
        target.f_backward()?;

        let gradients = activations.grad();
        let gradients = if gradients.defined() {
            Some(tensor_to_array3(&gradients)?)
        } else {
            None
        };
        Ok(ActivationGradients {
            activations: tensor_to_array3(&activations.detach())?,
            gradients,
        })
    }

    fn to_model_input(&self, input: &InputTensor) -> Result<Tensor, PipelineError> {
        let (h, w, c) = input.shape();
        let data = input.data();
        let slice = data.as_slice().ok_or_else(|| {
            PipelineError::Internal("input tensor is not contiguous".into())
        })?;
        let nhwc = Tensor::f_from_slice(slice)?.f_reshape([1, h as i64, w as i64, c as i64])?;
        let x = match self.layout {
            TensorLayout::Nchw => nhwc.f_permute([0, 3, 1, 2])?.contiguous(),
            TensorLayout::Nhwc => nhwc,
        };
        Ok(x.to_device(self.device))
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>, PipelineError> {
    let flat = tensor
        .to_device(Device::Cpu)
        .f_to_kind(Kind::Float)?
        .f_reshape([-1])?
        .contiguous();
    let len = flat.size()[0] as usize;
    let mut values = vec![0.0f32; len];
    flat.copy_data(&mut values, len);
    Ok(values)
}

fn tensor_to_array3(tensor: &Tensor) -> Result<Array3<f32>, PipelineError> {
    let size = tensor.size();
    let (c, h, w) = match size.as_slice() {
        [1, c, h, w] => (*c as usize, *h as usize, *w as usize),
        other => {
            return Err(PipelineError::Internal(format!(
                "expected [1, C, h, w] activations, got {:?}",
                other
            )));
        }
    };
    let values = tensor_to_vec(tensor)?;
    Ok(Array3::from_shape_vec((c, h, w), values)?)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::{AppConfig, BUNDLED_CONFIG};
    use ndarray::Array3;
    use std::sync::Arc;

    fn pattern_input(seed: f32) -> InputTensor {
        InputTensor::new(Array3::from_shape_fn((224, 224, 3), |(y, x, c)| {
            ((x as f32 * 0.03 + y as f32 * 0.05 + c as f32 + seed).sin()) * 2.0
        }))
    }

    #[test]
    fn probabilities_sum_to_one_and_are_bounded() {
        let engine = tiny_engine();
        let probs = engine.infer(&pattern_input(0.0)).unwrap();
        assert_eq!(probs.len(), 7);
        let sum: f32 = probs.values().iter().sum();
        assert!((sum - 1.0).abs() <= 1e-3);
        assert!(probs.values().iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn inference_is_deterministic() {
        let engine = tiny_engine();
        let input = pattern_input(1.5);
        let a = engine.infer(&input).unwrap();
        let b = engine.infer(&input).unwrap();
        for (x, y) in a.values().iter().zip(b.values()) {
            assert!((x - y).abs() <= 1e-5);
        }
    }

    #[test]
    fn gradients_have_activation_shape() {
        let engine = tiny_engine();
        let input = pattern_input(0.3);
        let class = engine.infer(&input).unwrap().argmax();
        let grads = engine.activation_gradients(&input, class).unwrap();
        // 224 input, 3x3 kernel, stride 4.
        assert_eq!(grads.activations.dim(), (8, 56, 56));
        let gradients = grads.gradients.unwrap();
        assert_eq!(gradients.dim(), grads.activations.dim());
        assert!(gradients.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn gradient_pass_does_not_change_predictions() {
        let engine = tiny_engine();
        let input = pattern_input(2.0);
        let before = engine.infer(&input).unwrap();
        engine.activation_gradients(&input, 3).unwrap();
        engine.activation_gradients(&input, 3).unwrap();
        let after = engine.infer(&input).unwrap();
        for (x, y) in before.values().iter().zip(after.values()) {
            assert!((x - y).abs() <= 1e-5);
        }
    }

    #[test]
    fn constant_network_yields_zero_gradients() {
        let engine = engine_with(Box::new(ConstantNet::new(7)), 7);
        let input = pattern_input(0.0);
        let probs = engine.infer(&input).unwrap();
        // Uniform scores: the first index wins the tie.
        assert_eq!(probs.argmax(), 0);
        let grads = engine.activation_gradients(&input, 0).unwrap();
        assert!(grads.gradients.unwrap().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn wrong_class_count_is_internal_error() {
        let engine = engine_with(Box::new(TinyNet::new(5)), 7);
        let err = engine.infer(&pattern_input(0.0)).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[test]
    fn warm_up_passes_for_consistent_model() {
        assert!(tiny_engine().warm_up(224).is_ok());
        let mismatched = engine_with(Box::new(TinyNet::new(5)), 7);
        assert!(matches!(
            mismatched.warm_up(224),
            Err(PipelineError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn missing_artifact_is_model_unavailable() {
        let mut config = AppConfig::from_yaml_str(BUNDLED_CONFIG).unwrap();
        config.model.path = "models/definitely-missing.pt".into();
        let err = InferenceEngine::load(&config.model, 7).err().unwrap();
        assert!(matches!(err, PipelineError::ModelUnavailable(_)));
    }

    #[test]
    fn probability_output_mode_skips_softmax() {
        let net = Arc::new(TinyNet::new(7));
        let logits = engine_with(Box::new(net.clone()), 7);
        let probabilities = engine_configured(Box::new(SoftmaxHead(net)), 7, |model| {
            model.output = ModelOutput::Probabilities;
        });
        assert!(probabilities.warm_up(224).is_ok());

        let input = pattern_input(0.7);
        let want = logits.infer(&input).unwrap();
        let got = probabilities.infer(&input).unwrap();
        for (x, y) in got.values().iter().zip(want.values()) {
            assert!((x - y).abs() <= 1e-5);
        }

        let grads = probabilities
            .activation_gradients(&input, got.argmax())
            .unwrap();
        let gradients = grads.gradients.unwrap();
        assert_eq!(gradients.dim(), (8, 56, 56));
        assert!(gradients.iter().all(|g| g.is_finite()));
        assert!(gradients.iter().any(|g| *g != 0.0));
    }

    #[test]
    fn nhwc_layout_feeds_channels_last() {
        let net = Arc::new(TinyNet::new(7));
        let nchw = engine_with(Box::new(net.clone()), 7);
        let nhwc = engine_configured(Box::new(ChannelsLast(net)), 7, |model| {
            model.layout = TensorLayout::Nhwc;
        });

        let input = pattern_input(1.1);
        let want = nchw.infer(&input).unwrap();
        let got = nhwc.infer(&input).unwrap();
        for (x, y) in got.values().iter().zip(want.values()) {
            assert!((x - y).abs() <= 1e-5);
        }
        let grads = nhwc.activation_gradients(&input, 2).unwrap();
        assert_eq!(grads.activations.dim(), (8, 56, 56));
    }

    #[test]
    fn probability_vector_validation() {
        assert!(ProbabilityVector::new(vec![0.5, 0.5], 2).is_ok());
        assert!(ProbabilityVector::new(vec![0.5, 0.5], 3).is_err());
        assert!(ProbabilityVector::new(vec![0.9, 0.9], 2).is_err());
        assert!(ProbabilityVector::new(vec![f32::NAN, 1.0], 2).is_err());

        let probs = ProbabilityVector::new(vec![0.1, 0.45, 0.45], 3).unwrap();
        assert_eq!(probs.argmax(), 1);
        assert!((probs.top() - 0.45).abs() < 1e-7);
    }
}
