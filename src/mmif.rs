use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

pub const MMIF_VERSION: &str = "http://mmif.clams.ai/1.0.5";

/// Vocabulary type URIs read and written by this app. Matching is done on the
/// type shortname so newer vocabulary versions in incoming documents still
/// resolve.
pub mod vocab {
    pub const AUDIO_DOCUMENT: &str = "http://mmif.clams.ai/vocabulary/AudioDocument/v1";
    pub const VIDEO_DOCUMENT: &str = "http://mmif.clams.ai/vocabulary/VideoDocument/v1";
    pub const TEXT_DOCUMENT: &str = "http://mmif.clams.ai/vocabulary/TextDocument/v1";
    pub const TIME_FRAME: &str = "http://mmif.clams.ai/vocabulary/TimeFrame/v5";
    pub const ALIGNMENT: &str = "http://mmif.clams.ai/vocabulary/Alignment/v1";
    pub const TOKEN: &str = "http://vocab.lappsgrid.org/Token";
    pub const SENTENCE: &str = "http://vocab.lappsgrid.org/Sentence";
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Mmif {
    pub metadata: MmifMetadata,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub views: Vec<View>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MmifMetadata {
    pub mmif: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Document {
    #[serde(rename = "@type")]
    pub at_type: String,
    pub properties: DocumentProperties,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DocumentProperties {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct View {
    pub id: String,
    pub metadata: ViewMetadata,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ViewMetadata {
    pub app: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub contains: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ViewError>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ViewError {
    pub message: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Annotation {
    #[serde(rename = "@type")]
    pub at_type: String,
    pub properties: Map<String, Value>,
}

impl Mmif {
    /// All documents whose `@type` resolves to the given vocabulary shortname.
    pub fn documents_by_type<'a>(&'a self, shortname: &str) -> Vec<&'a Document> {
        self.documents
            .iter()
            .filter(|doc| at_type_shortname(&doc.at_type) == shortname)
            .collect()
    }

    /// Id for the next view appended to this document.
    pub fn new_view_id(&self) -> String {
        format!("v_{}", self.views.len())
    }
}

impl Document {
    /// Resolves the document location to a local filesystem path. Accepts
    /// `file://` URIs and bare paths, which is what CLAMS pipelines emit.
    pub fn location_path(&self) -> Result<PathBuf> {
        let Some(location) = self.properties.location.as_deref() else {
            bail!("document '{}' has no location", self.properties.id);
        };
        if let Ok(url) = Url::parse(location) {
            if url.scheme() == "file" {
                return match url.to_file_path() {
                    Ok(path) => Ok(path),
                    Err(()) => bail!(
                        "document '{}' has an invalid file URI: {}",
                        self.properties.id,
                        location
                    ),
                };
            }
        }
        Ok(PathBuf::from(location))
    }
}

impl View {
    pub fn new(id: String, app: String, parameters: Map<String, Value>) -> Self {
        Self {
            id,
            metadata: ViewMetadata {
                app,
                contains: Map::new(),
                parameters,
                error: None,
            },
            annotations: Vec::new(),
        }
    }

    /// An error view per the CLAMS convention: the failure message in the view
    /// metadata and no annotations.
    pub fn with_error(
        id: String,
        app: String,
        parameters: Map<String, Value>,
        message: String,
    ) -> Self {
        let mut view = Self::new(id, app, parameters);
        view.metadata.error = Some(ViewError { message });
        view
    }

    pub fn new_contain(&mut self, at_type: &str, properties: Map<String, Value>) {
        self.metadata
            .contains
            .insert(at_type.to_string(), Value::Object(properties));
    }
}

impl Annotation {
    pub fn new(at_type: &str, id: &str) -> Self {
        let mut properties = Map::new();
        properties.insert("id".into(), Value::String(id.to_string()));
        Self {
            at_type: at_type.to_string(),
            properties,
        }
    }

    pub fn prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Last path segment of a vocabulary type URI, minus any trailing version
/// marker, e.g. `http://mmif.clams.ai/vocabulary/TimeFrame/v5` -> `TimeFrame`.
pub fn at_type_shortname(at_type: &str) -> &str {
    let mut segments = at_type.trim_end_matches('/').rsplit('/');
    let last = segments.next().unwrap_or(at_type);
    let is_version = last.len() > 1
        && last.starts_with('v')
        && last[1..].chars().all(|c| c.is_ascii_digit());
    if is_version {
        segments.next().unwrap_or(last)
    } else {
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mmif() -> Mmif {
        serde_json::from_value(serde_json::json!({
            "metadata": {"mmif": MMIF_VERSION},
            "documents": [
                {
                    "@type": "http://mmif.clams.ai/vocabulary/AudioDocument/v1",
                    "properties": {
                        "id": "d1",
                        "location": "file:///data/audio/clip.wav",
                        "mime": "audio/wav"
                    }
                },
                {
                    "@type": "http://mmif.clams.ai/vocabulary/VideoDocument/v2",
                    "properties": {"id": "d2", "location": "/data/video/clip.mp4"}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn shortname_strips_version_segment() {
        assert_eq!(at_type_shortname(vocab::TIME_FRAME), "TimeFrame");
        assert_eq!(at_type_shortname(vocab::TOKEN), "Token");
        assert_eq!(
            at_type_shortname("http://mmif.clams.ai/vocabulary/AudioDocument/v3"),
            "AudioDocument"
        );
    }

    #[test]
    fn documents_by_type_ignores_vocab_version() {
        let mmif = sample_mmif();
        assert_eq!(mmif.documents_by_type("AudioDocument").len(), 1);
        assert_eq!(mmif.documents_by_type("VideoDocument").len(), 1);
        assert_eq!(mmif.documents_by_type("TextDocument").len(), 0);
    }

    #[test]
    fn location_path_handles_file_uri_and_bare_path() {
        let mmif = sample_mmif();
        assert_eq!(
            mmif.documents[0].location_path().unwrap(),
            PathBuf::from("/data/audio/clip.wav")
        );
        assert_eq!(
            mmif.documents[1].location_path().unwrap(),
            PathBuf::from("/data/video/clip.mp4")
        );
    }

    #[test]
    fn location_path_fails_without_location() {
        let doc: Document = serde_json::from_value(serde_json::json!({
            "@type": vocab::AUDIO_DOCUMENT,
            "properties": {"id": "d9"}
        }))
        .unwrap();
        assert!(doc.location_path().is_err());
    }

    #[test]
    fn error_view_serializes_error_and_no_annotations() {
        let view = View::with_error(
            "v_0".into(),
            "http://apps.clams.ai/whisper-wrapper/v1".into(),
            Map::new(),
            "no audio document".into(),
        );
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["metadata"]["error"]["message"], "no audio document");
        assert!(json["annotations"].as_array().unwrap().is_empty());
        assert!(json["metadata"].get("contains").is_none());
    }

    #[test]
    fn mmif_round_trips_through_json() {
        let mmif = sample_mmif();
        let text = serde_json::to_string(&mmif).unwrap();
        let back: Mmif = serde_json::from_str(&text).unwrap();
        assert_eq!(back.documents.len(), 2);
        assert_eq!(back.documents[0].properties.mime.as_deref(), Some("audio/wav"));
        assert_eq!(back.new_view_id(), "v_0");
    }
}
