//! Grad-CAM saliency maps and their overlay onto the display image.
//!
//! The numeric half (`grad_cam`, `upsample`, `normalize_unit`) works on
//! plain arrays; only `overlay` knows about pixels and colour.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use ndarray::{Array2, Array3, Axis};

use crate::error::PipelineError;
use crate::pipeline::model::InferenceEngine;
use crate::pipeline::preprocess::{DisplayImage, InputTensor};

const FLAT_MAP_EPSILON: f32 = 1e-8;

/// Per-pixel importance in [0, 1], same size as the display image.
/// An all-zero map renders as a transparent overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    intensities: Array2<f32>,
}

impl SaliencyMap {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            intensities: Array2::zeros((height as usize, width as usize)),
        }
    }

    #[cfg(test)]
    pub fn intensities(&self) -> &Array2<f32> {
        &self.intensities
    }

    /// `(width, height)`, matching `image` conventions.
    pub fn dimensions(&self) -> (u32, u32) {
        let (h, w) = self.intensities.dim();
        (w as u32, h as u32)
    }

    pub fn is_blank(&self) -> bool {
        self.intensities.iter().all(|v| *v == 0.0)
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.intensities
            .get((y as usize, x as usize))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Coarse class activation map: ReLU(sum_c mean(grad_c) * A_c).
///
/// Fails with `SaliencyDegenerate` when the gradient carries no signal
/// (undefined, non-finite, or zero everywhere).
pub fn grad_cam(
    activations: &Array3<f32>,
    gradients: Option<&Array3<f32>>,
) -> Result<Array2<f32>, PipelineError> {
    let gradients = gradients
        .ok_or_else(|| PipelineError::SaliencyDegenerate("gradient is undefined".into()))?;
    if gradients.dim() != activations.dim() {
        return Err(PipelineError::Internal(format!(
            "gradient shape {:?} does not match activations {:?}",
            gradients.dim(),
            activations.dim()
        )));
    }
    if gradients.iter().chain(activations.iter()).any(|v| !v.is_finite()) {
        return Err(PipelineError::SaliencyDegenerate(
            "non-finite gradient or activation".into(),
        ));
    }

    let weights = gradients
        .mean_axis(Axis(2))
        .and_then(|g| g.mean_axis(Axis(1)))
        .ok_or_else(|| PipelineError::SaliencyDegenerate("empty activation map".into()))?;
    if weights.iter().all(|w| *w == 0.0) {
        return Err(PipelineError::SaliencyDegenerate(
            "all-zero gradient".into(),
        ));
    }

    let (_, h, w) = activations.dim();
    let mut cam = Array2::<f32>::zeros((h, w));
    for (channel, weight) in activations.axis_iter(Axis(0)).zip(weights.iter()) {
        cam.scaled_add(*weight, &channel);
    }
    cam.mapv_inplace(|v| v.max(0.0));

    if cam.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::SaliencyDegenerate(
            "non-finite activation map".into(),
        ));
    }
    Ok(cam)
}

/// Min-max normalization to [0, 1]; a flat map becomes all zeros.
pub fn normalize_unit(mut map: Array2<f32>) -> Array2<f32> {
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() || max - min <= FLAT_MAP_EPSILON {
        map.fill(0.0);
        return map;
    }
    let range = max - min;
    map.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    map
}

/// Bilinear (triangle filter) resize of a [0, 1] map to `width x height`.
pub fn upsample(map: &Array2<f32>, width: u32, height: u32) -> Result<Array2<f32>, PipelineError> {
    let (h, w) = map.dim();
    let raw: Vec<f32> = map.iter().copied().collect();
    let coarse: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(w as u32, h as u32, raw).ok_or_else(|| {
            PipelineError::Internal(format!("cannot build {}x{} saliency buffer", w, h))
        })?;
    let resized = imageops::resize(&coarse, width, height, FilterType::Triangle);
    Ok(Array2::from_shape_vec(
        (height as usize, width as usize),
        resized.into_raw(),
    )?)
}

/// Blue to red "jet" ramp.
pub fn jet(value: f32) -> [u8; 3] {
    let v = if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let channel =
        |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// `alpha * jet(map) + (1 - alpha) * display`, pixel by pixel.
pub fn overlay(display: &DisplayImage, map: &SaliencyMap, alpha: f32) -> RgbImage {
    debug_assert_eq!(map.dimensions(), display.dimensions());
    let mut out = display.image().clone();
    if map.is_blank() {
        return out;
    }
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let heat = jet(map.get(x, y));
        for c in 0..3 {
            let blended = alpha * heat[c] as f32 + (1.0 - alpha) * pixel[c] as f32;
            pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct SaliencyGenerator {
    heatmap_alpha: f32,
}

impl SaliencyGenerator {
    pub fn new(heatmap_alpha: f32) -> Self {
        Self { heatmap_alpha }
    }

    /// Grad-CAM for `class_index`, sized to `display`. Degenerate gradients
    /// are logged and produce a blank map instead of an error.
    pub fn explain(
        &self,
        engine: &InferenceEngine,
        tensor: &InputTensor,
        display: &DisplayImage,
        class_index: usize,
    ) -> Result<SaliencyMap, PipelineError> {
        let (width, height) = display.dimensions();
        let captured = engine.activation_gradients(tensor, class_index)?;

        let coarse = match grad_cam(&captured.activations, captured.gradients.as_ref()) {
            Ok(cam) => cam,
            Err(PipelineError::SaliencyDegenerate(reason)) => {
                log::warn!(
                    "Saliency for class {} is degenerate ({}); returning blank heatmap",
                    class_index,
                    reason
                );
                return Ok(SaliencyMap::blank(width, height));
            }
            Err(e) => return Err(e),
        };

        // Resizing clamps f32 samples to [0, 1], so scale before upsampling.
        let coarse = normalize_unit(coarse);
        let intensities = normalize_unit(upsample(&coarse, width, height)?);
        Ok(SaliencyMap { intensities })
    }

    pub fn render(&self, display: &DisplayImage, map: &SaliencyMap) -> RgbImage {
        overlay(display, map, self.heatmap_alpha)
    }
}
