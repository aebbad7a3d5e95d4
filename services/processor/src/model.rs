//! Posts, face observations and per-picture enrichment results.
//!
//! Posts arrive from the live stream and are read-only to the processor.
//! Face observations only live for the duration of one detector response;
//! the [`EnrichmentResult`] derived from them is what the rolling buffer keeps.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Media type tag identifying a displayable photo attachment.
pub const PHOTO_MEDIA_TYPE: &str = "photo";

/// Errors raised while building model values.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid picture locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },
}

/// One post ingested from the live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    /// Opaque post identifier
    pub id: String,

    /// Post text, matched against the filter criterion
    #[serde(default)]
    pub text: String,

    /// Attached media in the order the transport delivered them
    #[serde(default)]
    pub media: Vec<Attachment>,
}

/// A media reference embedded in a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Media type tag (e.g. "photo", "video", "animated_gif")
    pub media_type: String,

    /// Resolvable picture locator
    pub url: String,
}

impl Attachment {
    pub fn is_photo(&self) -> bool {
        self.media_type.eq_ignore_ascii_case(PHOTO_MEDIA_TYPE)
    }
}

impl Post {
    /// Attachments tagged as photos.
    pub fn photos(&self) -> impl Iterator<Item = &Attachment> {
        self.media.iter().filter(|media| media.is_photo())
    }

    /// Whether at least one attachment is a photo.
    pub fn has_photo(&self) -> bool {
        self.photos().next().is_some()
    }

    /// Case-insensitive containment check against a filter criterion.
    ///
    /// An empty (or whitespace-only) criterion matches every post.
    pub fn matches(&self, criterion: &str) -> bool {
        let needle = criterion.trim();
        needle.is_empty() || self.text.to_lowercase().contains(&needle.to_lowercase())
    }
}

/// Perceived gender reported for a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    /// Map a detector label to a gender; anything other than an exact
    /// (case-insensitive) "male" or "female" is unknown.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some(l) if l.eq_ignore_ascii_case("male") => Gender::Male,
            Some(l) if l.eq_ignore_ascii_case("female") => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// One face returned by the detector for a picture.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub gender: Gender,

    /// Remaining detector attributes, unused by aggregation
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl FaceObservation {
    pub fn new(gender: Gender) -> Self {
        Self {
            gender,
            attributes: serde_json::Map::new(),
        }
    }
}

/// Face counts for one picture.
///
/// `male` and `female` only count exact matches; unknown faces only
/// contribute to `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaceTally {
    pub total: usize,
    pub female: usize,
    pub male: usize,
}

impl FaceTally {
    pub fn count(faces: &[FaceObservation]) -> Self {
        faces.iter().fold(
            FaceTally {
                total: faces.len(),
                ..Default::default()
            },
            |mut tally, face| {
                match face.gender {
                    Gender::Male => tally.male += 1,
                    Gender::Female => tally.female += 1,
                    Gender::Unknown => {}
                }
                tally
            },
        )
    }
}

/// Outcome of analysing one picture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentResult {
    #[serde(with = "url_serde")]
    source_image_url: Url,
    total_face_count: usize,
    female_face_count: usize,
    male_face_count: usize,
}

impl EnrichmentResult {
    /// Build a result for `locator`, which must be an absolute URL.
    pub fn new(
        locator: &str,
        total_face_count: usize,
        female_face_count: usize,
        male_face_count: usize,
    ) -> Result<Self, ModelError> {
        let source_image_url = Url::parse(locator).map_err(|e| ModelError::InvalidLocator {
            locator: locator.to_string(),
            reason: e.to_string(),
        })?;

        if source_image_url.cannot_be_a_base() {
            return Err(ModelError::InvalidLocator {
                locator: locator.to_string(),
                reason: "not a hierarchical absolute reference".to_string(),
            });
        }

        Ok(Self {
            source_image_url,
            total_face_count,
            female_face_count,
            male_face_count,
        })
    }

    pub fn source_image_url(&self) -> &Url {
        &self.source_image_url
    }

    pub fn total_face_count(&self) -> usize {
        self.total_face_count
    }

    pub fn female_face_count(&self) -> usize {
        self.female_face_count
    }

    pub fn male_face_count(&self) -> usize {
        self.male_face_count
    }
}

/// Analyse a detector response for one picture.
///
/// The stored male count is `total - female`, while the returned tally
/// keeps exact male/female counts for the hourly rates.
pub fn classify_faces(
    locator: &str,
    faces: &[FaceObservation],
) -> Result<(EnrichmentResult, FaceTally), ModelError> {
    let tally = FaceTally::count(faces);
    let result = EnrichmentResult::new(
        locator,
        tally.total,
        tally.female,
        tally.total - tally.female,
    )?;
    Ok((result, tally))
}

/// Serialize helper for URLs (reqwest does not enable url's serde support)
mod url_serde {
    use reqwest::Url;
    use serde::Serializer;

    pub fn serialize<S>(url: &Url, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn faces(genders: &[Gender]) -> Vec<FaceObservation> {
        genders.iter().copied().map(FaceObservation::new).collect()
    }

    #[test]
    fn test_deserialize_post() {
        let json = r#"{
            "id": "1068201",
            "text": "Spring looks #FashionFace",
            "media": [
                {"media_type": "photo", "url": "https://pbs.example.com/media/a.jpg"},
                {"media_type": "video", "url": "https://video.example.com/b.mp4"}
            ]
        }"#;

        let post: Post = serde_json::from_str(json).unwrap();
        assert_eq!(post.id, "1068201");
        assert_eq!(post.media.len(), 2);
        assert_eq!(post.photos().count(), 1);
        assert!(post.has_photo());
    }

    #[test]
    fn test_photo_match_is_case_insensitive() {
        let attachment = Attachment {
            media_type: "PHOTO".to_string(),
            url: "https://pbs.example.com/a.jpg".to_string(),
        };
        assert!(attachment.is_photo());
    }

    #[test]
    fn test_post_without_photo() {
        let post = Post {
            id: "1".to_string(),
            text: String::new(),
            media: vec![Attachment {
                media_type: "animated_gif".to_string(),
                url: "https://pbs.example.com/a.gif".to_string(),
            }],
        };
        assert!(!post.has_photo());
    }

    #[test]
    fn test_post_matches_criterion() {
        let post = Post {
            id: "1".to_string(),
            text: "Loving this #fashionface look".to_string(),
            media: Vec::new(),
        };
        assert!(post.matches("#FashionFace"));
        assert!(post.matches(""));
        assert!(!post.matches("#rustlang"));
    }

    #[test]
    fn test_gender_from_label() {
        assert_eq!(Gender::from_label(Some("Female")), Gender::Female);
        assert_eq!(Gender::from_label(Some("MALE")), Gender::Male);
        assert_eq!(Gender::from_label(Some("other")), Gender::Unknown);
        assert_eq!(Gender::from_label(None), Gender::Unknown);
    }

    #[test]
    fn test_classify_mixed_faces() {
        let (result, tally) = classify_faces(
            "https://pbs.example.com/media/a.jpg",
            &faces(&[Gender::Female, Gender::Male]),
        )
        .unwrap();

        assert_eq!(result.total_face_count(), 2);
        assert_eq!(result.female_face_count(), 1);
        assert_eq!(result.male_face_count(), 1);
        assert_eq!(tally.male, 1);
    }

    #[test]
    fn test_classify_unknown_faces() {
        let (result, tally) = classify_faces(
            "https://pbs.example.com/media/a.jpg",
            &faces(&[Gender::Unknown, Gender::Female, Gender::Unknown]),
        )
        .unwrap();

        assert_eq!(result.total_face_count(), 3);
        assert_eq!(result.female_face_count(), 1);
        assert_eq!(result.male_face_count(), 2);
        // Unknown faces stay out of both rate buckets
        assert_eq!(tally.male, 0);
        assert_eq!(tally.female, 1);
        assert!(tally.male + tally.female <= tally.total);
    }

    #[test]
    fn test_classify_no_faces() {
        let (result, tally) = classify_faces("https://pbs.example.com/a.jpg", &[]).unwrap();
        assert_eq!(result.total_face_count(), 0);
        assert_eq!(result.male_face_count(), 0);
        assert_eq!(tally, FaceTally::default());
    }

    #[test]
    fn test_tally_bounded_by_total() {
        let all = [Gender::Male, Gender::Female, Gender::Unknown];
        for len in 0..6 {
            let observed: Vec<Gender> = (0..len).map(|i| all[i % 3]).collect();
            let tally = FaceTally::count(&faces(&observed));
            assert_eq!(tally.total, len);
            assert!(tally.male + tally.female <= tally.total);
        }
    }

    #[test]
    fn test_relative_locator_rejected() {
        let result = EnrichmentResult::new("media/a.jpg", 1, 0, 1);
        assert!(matches!(result, Err(ModelError::InvalidLocator { .. })));
    }

    #[test]
    fn test_non_hierarchical_locator_rejected() {
        let result = EnrichmentResult::new("mailto:someone@example.com", 0, 0, 0);
        assert!(matches!(result, Err(ModelError::InvalidLocator { .. })));
    }

    #[test]
    fn test_result_serializes_url_as_string() {
        let result = EnrichmentResult::new("https://pbs.example.com/a.jpg", 1, 1, 0).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["source_image_url"], "https://pbs.example.com/a.jpg");
        assert_eq!(json["female_face_count"], 1);
    }
}
