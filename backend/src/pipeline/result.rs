use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::NaiveDateTime;
use image::{ImageFormat, RgbImage};
use shared::{
    ClassInfo, FormattedProbabilities, OrderedMap, PredictionResponse, PredictionSummary,
    SortedProbabilities,
};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::error::PipelineError;
use crate::pipeline::model::ProbabilityVector;
use crate::pipeline::preprocess::DisplayImage;
use crate::pipeline::registry::ClassRegistry;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything one request produces. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub predicted_class_index: usize,
    pub class_info: ClassInfo,
    /// Top probability as a percentage, full precision.
    pub raw_confidence: f64,
    pub probabilities: FormattedProbabilities,
    pub sorted_probabilities: SortedProbabilities,
    pub timestamp: String,
    pub display_image: String,
    pub heatmap: String,
}

impl PredictionResult {
    /// One decimal place plus "%", e.g. `"87.3%"`.
    pub fn confidence(&self) -> String {
        format!("{:.1}%", self.raw_confidence)
    }

    pub fn into_response(self) -> PredictionResponse {
        let confidence = self.confidence();
        PredictionResponse {
            success: true,
            prediction: PredictionSummary {
                class: self.predicted_class_index,
                class_name: self.class_info.full_name.clone(),
                confidence,
                raw_confidence: self.raw_confidence,
                timestamp: self.timestamp,
            },
            class_info: self.class_info,
            probabilities: self.probabilities,
            sorted_probabilities: self.sorted_probabilities,
            display_image: self.display_image,
            heatmap: self.heatmap,
        }
    }
}

pub fn assemble(
    probabilities: &ProbabilityVector,
    registry: &ClassRegistry,
    heatmap: &RgbImage,
    display: &DisplayImage,
    timestamp: NaiveDateTime,
) -> Result<PredictionResult, PipelineError> {
    registry
        .ensure_covers(probabilities.len())
        .map_err(|e| PipelineError::Internal(e.to_string()))?;

    let predicted_class_index = probabilities.argmax();
    let class_info = registry
        .get(predicted_class_index)
        .cloned()
        .ok_or_else(|| {
            PipelineError::Internal(format!(
                "no registry entry for class {}",
                predicted_class_index
            ))
        })?;

    let percentages: Vec<(String, f64)> = registry
        .names()
        .zip(probabilities.values())
        .map(|(name, p)| (name.to_string(), *p as f64 * 100.0))
        .collect();

    let probabilities_formatted = OrderedMap(
        percentages
            .iter()
            .map(|(name, percent)| (name.clone(), format!("{:.2}%", percent)))
            .collect(),
    );

    let mut ranked: Vec<(usize, (String, f64))> = percentages.into_iter().enumerate().collect();
    ranked.sort_by(|(ia, (_, a)), (ib, (_, b))| {
        b.partial_cmp(a).unwrap_or(Ordering::Equal).then(ia.cmp(ib))
    });
    let sorted_probabilities = OrderedMap(ranked.into_iter().map(|(_, entry)| entry).collect());

    Ok(PredictionResult {
        predicted_class_index,
        class_info,
        raw_confidence: probabilities.top() as f64 * 100.0,
        probabilities: probabilities_formatted,
        sorted_probabilities,
        timestamp: timestamp.format(TIMESTAMP_FORMAT).to_string(),
        display_image: encode_png_base64(display.image())?,
        heatmap: encode_png_base64(heatmap)?,
    })
}

/// PNG bytes, base64 with the standard alphabet. Nothing touches disk.
pub fn encode_png_base64(image: &RgbImage) -> Result<String, PipelineError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| PipelineError::Internal(format!("png encoding: {}", e)))?;
    Ok(STANDARD.encode(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registry::BUNDLED_REGISTRY;
    use chrono::NaiveDate;
    use image::Rgb;

    fn registry() -> ClassRegistry {
        ClassRegistry::from_yaml_str(BUNDLED_REGISTRY).unwrap()
    }

    fn timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap()
    }

    fn images() -> (RgbImage, DisplayImage) {
        let display = RgbImage::from_pixel(12, 8, Rgb([200, 150, 120]));
        let heatmap = RgbImage::from_pixel(12, 8, Rgb([10, 20, 250]));
        (heatmap, DisplayImage::new(display))
    }

    fn assemble_probs(values: Vec<f32>) -> PredictionResult {
        let probs = ProbabilityVector::new(values, 7).unwrap();
        let (heatmap, display) = images();
        assemble(&probs, &registry(), &heatmap, &display, timestamp()).unwrap()
    }

    #[test]
    fn picks_top_class_and_formats_confidence() {
        let result = assemble_probs(vec![0.05, 0.8734, 0.02, 0.0166, 0.02, 0.01, 0.01]);
        assert_eq!(result.predicted_class_index, 1);
        assert_eq!(result.class_info.abbr, "NV");
        assert_eq!(result.confidence(), "87.3%");
        assert!((result.raw_confidence - 87.34).abs() < 1e-4);
        assert_eq!(result.timestamp, "2024-03-09 14:05:07");
        assert_eq!(
            result.probabilities.get("Nevus (NV)").map(String::as_str),
            Some("87.34%")
        );
    }

    #[test]
    fn sorted_probabilities_are_a_descending_permutation() {
        let values = vec![0.1, 0.3, 0.05, 0.2, 0.15, 0.12, 0.08];
        let result = assemble_probs(values.clone());
        let sorted = &result.sorted_probabilities;

        assert_eq!(sorted.len(), 7);
        let percents: Vec<f64> = sorted.iter().map(|(_, p)| *p).collect();
        assert!(percents.windows(2).all(|w| w[0] >= w[1]));

        let mut names: Vec<&str> = sorted.iter().map(|(n, _)| n.as_str()).collect();
        names.sort();
        let mut expected: Vec<&str> = registry().names().collect();
        expected.sort();
        assert_eq!(names, expected);

        let mass: f64 = percents.iter().sum();
        let expected_mass: f64 = values.iter().map(|p| *p as f64 * 100.0).sum();
        assert!((mass - expected_mass).abs() < 1e-9);

        assert_eq!(sorted.first().unwrap().1, result.raw_confidence);
    }

    #[test]
    fn ties_keep_class_index_order() {
        let result = assemble_probs(vec![0.1, 0.2, 0.2, 0.1, 0.2, 0.1, 0.1]);
        let order: Vec<&str> = result
            .sorted_probabilities
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(
            order,
            vec![
                "Nevus (NV)",
                "Basal Cell Carcinoma (BCC)",
                "Benign Keratosis (BKL)",
                "Melanoma (MEL)",
                "Actinic Keratoses (AKIEC)",
                "Dermatofibroma (DF)",
                "Vascular lesions (VASC)",
            ]
        );
        assert_eq!(result.predicted_class_index, 1);
    }

    #[test]
    fn images_are_inline_png() {
        let result = assemble_probs(vec![0.4, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
        for encoded in [&result.display_image, &result.heatmap] {
            let bytes = STANDARD.decode(encoded).unwrap();
            assert_eq!(
                image::guess_format(&bytes).unwrap(),
                ImageFormat::Png
            );
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (12, 8));
        }
        let heatmap = image::load_from_memory(&STANDARD.decode(&result.heatmap).unwrap())
            .unwrap()
            .to_rgb8();
        assert_eq!(heatmap.get_pixel(0, 0).0, [10, 20, 250]);
    }

    #[test]
    fn response_carries_class_info_and_success() {
        let response =
            assemble_probs(vec![0.7, 0.05, 0.05, 0.05, 0.05, 0.05, 0.05]).into_response();
        assert!(response.success);
        assert_eq!(response.prediction.class, 0);
        assert_eq!(response.prediction.class_name, "Melanoma (MEL)");
        assert_eq!(response.prediction.confidence, "70.0%");
        assert_eq!(response.class_info.severity, shared::Severity::High);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["class_info"]["severity"], "high");
        assert_eq!(json["class_info"]["abbr"], "MEL");
        assert!(json["sorted_probabilities"].is_object());
    }

    #[test]
    fn registry_size_mismatch_is_internal() {
        let probs = ProbabilityVector::new(vec![0.5, 0.5], 2).unwrap();
        let (heatmap, display) = images();
        let err = assemble(&probs, &registry(), &heatmap, &display, timestamp()).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }
}
