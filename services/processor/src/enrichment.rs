//! Face detection client.
//!
//! The processor only depends on the [`FaceDetector`] trait. The HTTP
//! implementation talks to a Face API style `detect` endpoint asking for the
//! gender attribute only.

use crate::config::EnrichmentConfig;
use crate::model::{FaceObservation, Gender};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Errors that can occur while detecting faces.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("Face detection request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Face detection service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid face detection endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Detects faces in a picture.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Detect faces in the picture at `picture_url`. An empty list means no
    /// faces were found.
    async fn detect_faces(&self, picture_url: &str)
        -> Result<Vec<FaceObservation>, EnrichmentError>;
}

/// Face entry as returned by the detect endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectedFace {
    #[serde(default)]
    face_attributes: Option<FaceAttributes>,

    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FaceAttributes {
    #[serde(default)]
    gender: Option<String>,
}

impl From<DetectedFace> for FaceObservation {
    fn from(face: DetectedFace) -> Self {
        let label = face.face_attributes.and_then(|a| a.gender);
        FaceObservation {
            gender: Gender::from_label(label.as_deref()),
            attributes: face.other,
        }
    }
}

/// HTTP client for a Face API style detection service.
pub struct HttpFaceDetector {
    client: reqwest::Client,
    detect_url: Url,
    api_key: Option<String>,
}

impl HttpFaceDetector {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            detect_url: detect_url(&config.endpoint)?,
            api_key: config.api_key.clone(),
        })
    }

    pub fn detect_url(&self) -> &Url {
        &self.detect_url
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    #[instrument(skip(self))]
    async fn detect_faces(
        &self,
        picture_url: &str,
    ) -> Result<Vec<FaceObservation>, EnrichmentError> {
        let mut request = self
            .client
            .post(self.detect_url.clone())
            .json(&serde_json::json!({ "url": picture_url }));

        if let Some(key) = &self.api_key {
            request = request.header(SUBSCRIPTION_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let faces: Vec<DetectedFace> = response.json().await?;
        debug!(faces = faces.len(), "Face detection completed");

        Ok(faces.into_iter().map(FaceObservation::from).collect())
    }
}

/// Build the detect URL for `endpoint`, requesting the gender attribute.
fn detect_url(endpoint: &str) -> Result<Url, EnrichmentError> {
    let base = endpoint.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/detect"))
        .map_err(|e| EnrichmentError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(EnrichmentError::InvalidEndpoint(format!(
            "{endpoint}: scheme must be http or https"
        )));
    }

    url.query_pairs_mut()
        .append_pair("returnFaceId", "false")
        .append_pair("returnFaceLandmarks", "false")
        .append_pair("returnFaceAttributes", "gender");

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> EnrichmentConfig {
        EnrichmentConfig {
            endpoint: "https://westcentralus.api.cognitive.example.com/face/v1.0/".to_string(),
            api_key: Some("test-key".to_string()),
            request_timeout_secs: 5,
            max_in_flight: 4,
            max_pending: 64,
        }
    }

    #[test]
    fn test_detect_url() {
        let detector = HttpFaceDetector::new(&create_test_config()).unwrap();
        let url = detector.detect_url().as_str();

        assert!(url.starts_with("https://westcentralus.api.cognitive.example.com/face/v1.0/detect?"));
        assert!(url.contains("returnFaceAttributes=gender"));
        assert!(url.contains("returnFaceId=false"));
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            detect_url("not a url"),
            Err(EnrichmentError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            detect_url("ftp://faces.example.com"),
            Err(EnrichmentError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_decode_detected_faces() {
        let json = r#"[
            {
                "faceRectangle": {"top": 131, "left": 177, "width": 162, "height": 162},
                "faceAttributes": {"gender": "female"}
            },
            {
                "faceRectangle": {"top": 20, "left": 40, "width": 60, "height": 60},
                "faceAttributes": {"gender": "Male"}
            },
            {
                "faceRectangle": {"top": 1, "left": 2, "width": 3, "height": 4}
            }
        ]"#;

        let faces: Vec<DetectedFace> = serde_json::from_str(json).unwrap();
        let observations: Vec<FaceObservation> =
            faces.into_iter().map(FaceObservation::from).collect();

        assert_eq!(observations.len(), 3);
        assert_eq!(observations[0].gender, Gender::Female);
        assert_eq!(observations[1].gender, Gender::Male);
        assert_eq!(observations[2].gender, Gender::Unknown);
        assert!(observations[0].attributes.contains_key("faceRectangle"));
    }

    #[test]
    fn test_decode_null_gender() {
        let json = r#"[{"faceAttributes": {"gender": null}}]"#;
        let faces: Vec<DetectedFace> = serde_json::from_str(json).unwrap();
        let observation = FaceObservation::from(faces.into_iter().next().unwrap());
        assert_eq!(observation.gender, Gender::Unknown);
    }
}
