use actix_web::http::StatusCode;

pub const DECODE_FAILED_MESSAGE: &str = "Invalid or corrupt image. Please upload a valid image file.";
pub const MODEL_UNAVAILABLE_MESSAGE: &str = "Model not loaded. Please check server logs.";
pub const PREDICTION_FAILED_MESSAGE: &str = "Prediction failed. Please try again.";

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Image decode error: {0}")]
    Decode(String),
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Degenerate saliency map: {0}")]
    SaliencyDegenerate(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tch::TchError> for PipelineError {
    fn from(err: tch::TchError) -> Self {
        PipelineError::Internal(format!("libtorch: {}", err))
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        PipelineError::Internal(format!("tensor shape: {}", err))
    }
}

impl PipelineError {
    /// Text safe to show a client. Only input validation errors carry their
    /// detail through; everything else stays in the server log.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::InvalidInput(msg) => msg.clone(),
            PipelineError::Decode(_) => DECODE_FAILED_MESSAGE.to_string(),
            PipelineError::ModelUnavailable(_) => MODEL_UNAVAILABLE_MESSAGE.to_string(),
            PipelineError::SaliencyDegenerate(_) | PipelineError::Internal(_) => {
                PREDICTION_FAILED_MESSAGE.to_string()
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidInput(_) | PipelineError::Decode(_) => StatusCode::BAD_REQUEST,
            PipelineError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::SaliencyDegenerate(_) | PipelineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_keep_their_message() {
        let err = PipelineError::InvalidInput("File too large".into());
        assert_eq!(err.user_message(), "File too large");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_detail_is_hidden() {
        let err = PipelineError::Internal("libtorch: shape mismatch at aten/src/foo.cpp:42".into());
        assert_eq!(err.user_message(), PREDICTION_FAILED_MESSAGE);
        assert!(!err.user_message().contains("aten"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = PipelineError::Decode("unexpected EOF in huffman table".into());
        assert_eq!(err.user_message(), DECODE_FAILED_MESSAGE);
        assert!(err.user_message().contains("corrupt"));
    }

    #[test]
    fn model_unavailable_is_503() {
        let err = PipelineError::ModelUnavailable("models/x.pt missing".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.user_message(), MODEL_UNAVAILABLE_MESSAGE);
    }
}
