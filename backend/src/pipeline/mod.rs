pub mod model;
pub mod preprocess;
pub mod registry;
pub mod result;
pub mod saliency;

use chrono::Local;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::PipelineError;
use model::InferenceEngine;
use preprocess::Preprocessor;
use registry::ClassRegistry;
use result::PredictionResult;
use saliency::SaliencyGenerator;

/// One uploaded file, as handed over by the request handler.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub file_name: Option<String>,
}

/// Preprocess, infer, explain, assemble. Shared read-only across requests.
pub struct Pipeline {
    preprocessor: Preprocessor,
    engine: InferenceEngine,
    saliency: SaliencyGenerator,
    registry: Arc<ClassRegistry>,
}

impl Pipeline {
    /// Loads the model named in `config` and checks it against `registry`.
    pub fn load(config: &AppConfig, registry: Arc<ClassRegistry>) -> Result<Self, PipelineError> {
        let engine = InferenceEngine::load(&config.model, registry.len())?;
        Self::with_engine(config, registry, engine)
    }

    pub fn with_engine(
        config: &AppConfig,
        registry: Arc<ClassRegistry>,
        engine: InferenceEngine,
    ) -> Result<Self, PipelineError> {
        registry
            .ensure_covers(engine.num_classes())
            .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))?;
        let preprocessor = Preprocessor::from_config(config);
        engine.warm_up(preprocessor.input_size() as usize)?;
        log::info!(
            "Pipeline ready: model {}, preprocessing {}, {} classes",
            engine.version(),
            preprocessor.profile().version,
            registry.len()
        );

        Ok(Self {
            preprocessor,
            engine,
            saliency: SaliencyGenerator::new(config.saliency.heatmap_alpha),
            registry,
        })
    }

    pub fn model_version(&self) -> &str {
        self.engine.version()
    }

    /// Runs the whole pipeline for one upload. Either every stage succeeds
    /// or the first failure is returned; nothing is kept afterwards.
    pub fn predict(&self, upload: &Upload) -> Result<PredictionResult, PipelineError> {
        log::debug!(
            "Predicting {} ({} bytes, {}, sha256 {})",
            upload.file_name.as_deref().unwrap_or("<unnamed>"),
            upload.bytes.len(),
            upload.mime,
            hex::encode(Sha256::digest(&upload.bytes))
        );

        let (tensor, display) = self.preprocessor.preprocess(&upload.bytes, &upload.mime)?;
        let probabilities = self.engine.infer(&tensor)?;
        let predicted = probabilities.argmax();

        let map = self
            .saliency
            .explain(&self.engine, &tensor, &display, predicted)?;
        let heatmap = self.saliency.render(&display, &map);

        let result = result::assemble(
            &probabilities,
            &self.registry,
            &heatmap,
            &display,
            Local::now().naive_local(),
        )?;
        log::info!(
            "Predicted {} with {} confidence (model {})",
            result.class_info.abbr,
            result.confidence(),
            self.engine.version()
        );
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::BUNDLED_CONFIG;
    use crate::pipeline::model::testing::{engine_with, TinyNet};
    use crate::pipeline::model::Network;
    use crate::pipeline::registry::BUNDLED_REGISTRY;

    pub fn pipeline_with(network: Box<dyn Network>) -> Pipeline {
        let config = AppConfig::from_yaml_str(BUNDLED_CONFIG).unwrap();
        let registry = Arc::new(ClassRegistry::from_yaml_str(BUNDLED_REGISTRY).unwrap());
        let engine = engine_with(network, registry.len());
        Pipeline::with_engine(&config, registry, engine).unwrap()
    }

    pub fn tiny_pipeline() -> Pipeline {
        pipeline_with(Box::new(TinyNet::new(7)))
    }
}
