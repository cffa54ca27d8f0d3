use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::inference::audio_pipeline::TimedSegment;
use crate::inference::whisper::{ModelSize, Task};
use crate::metadata::{app_identifier, TIME_UNIT};
use crate::mmif::{vocab, Annotation, Mmif, View};
use crate::AppState;

/// Runtime parameters of the annotate endpoint, passed as query string
/// fields per the CLAMS HTTP convention.
#[derive(Deserialize, Debug, Default)]
pub struct RuntimeParams {
    #[serde(rename = "modelSize")]
    pub model_size: Option<String>,
    #[serde(rename = "modelLang")]
    pub model_lang: Option<String>,
    pub task: Option<String>,
    pub pretty: Option<bool>,
}

impl RuntimeParams {
    /// The parameter map recorded in the metadata of every view this request
    /// produces, error views included.
    pub fn as_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(size) = &self.model_size {
            map.insert("modelSize".into(), Value::String(size.clone()));
        }
        if let Some(lang) = &self.model_lang {
            map.insert("modelLang".into(), Value::String(lang.clone()));
        }
        if let Some(task) = &self.task {
            map.insert("task".into(), Value::String(task.clone()));
        }
        if let Some(pretty) = self.pretty {
            map.insert("pretty".into(), Value::Bool(pretty));
        }
        map
    }
}

/// A failed annotation request: reported back inside the MMIF document as an
/// error view, never as a process crash.
#[derive(Debug)]
pub struct AnnotateFailure {
    pub status: StatusCode,
    pub message: String,
}

fn fail(status: StatusCode, message: impl Into<String>) -> AnnotateFailure {
    AnnotateFailure {
        status,
        message: message.into(),
    }
}

/// Runs the whole document-in, document-out conversion: locate the media
/// documents, transcribe each one, and append a transcript view per document.
/// The input MMIF is only ever extended, never rewritten.
pub fn annotate(
    state: &AppState,
    mmif: &mut Mmif,
    params: &RuntimeParams,
) -> Result<(), AnnotateFailure> {
    let size = match &params.model_size {
        Some(value) => value.parse::<ModelSize>().map_err(|err| {
            fail(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid modelSize: {err}"))
        })?,
        None => state.default_size(),
    };
    let task = match &params.task {
        Some(value) => value.parse::<Task>().map_err(|err| {
            fail(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid task: {err}"))
        })?,
        None => Task::default(),
    };
    let language = params.model_lang.as_deref().filter(|lang| !lang.is_empty());

    // Audio documents first, falling back to video documents.
    let mut docs = mmif.documents_by_type("AudioDocument");
    if docs.is_empty() {
        docs = mmif.documents_by_type("VideoDocument");
    }
    if docs.is_empty() {
        return Err(fail(
            StatusCode::UNPROCESSABLE_ENTITY,
            "no audio or video document found in the input MMIF",
        ));
    }

    let mut located = Vec::with_capacity(docs.len());
    for doc in docs {
        let path = doc
            .location_path()
            .map_err(|err| fail(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))?;
        located.push((doc.properties.id.clone(), path));
    }

    debug!("whisper model: {size}");
    let model = state.model(size).map_err(|err| {
        fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to load whisper {size} model: {err}"),
        )
    })?;

    for (doc_id, path) in located {
        let bytes = std::fs::read(&path).map_err(|err| {
            fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot read media for document '{doc_id}' at {}: {err}", path.display()),
            )
        })?;
        let segments = model
            .clone()
            .run_transcribe(bytes.into_boxed_slice(), language, task)
            .map_err(|err| {
                fail(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("transcription failed for document '{doc_id}': {err}"),
                )
            })?;
        info!("document '{doc_id}': {} transcript segments", segments.len());
        let view = transcript_view(
            mmif.new_view_id(),
            &doc_id,
            &segments,
            language,
            params.as_map(),
        );
        mmif.views.push(view);
    }
    Ok(())
}

/// Builds the output view for one media document: a TextDocument with the full
/// transcript, an Alignment from the media to it, and per transcript segment a
/// speech TimeFrame, a Sentence over its Tokens, and a TimeFrame-to-Sentence
/// Alignment. Time offsets are emitted in milliseconds, character offsets are
/// relative to the text document.
pub fn transcript_view(
    view_id: String,
    doc_id: &str,
    segments: &[TimedSegment],
    language: Option<&str>,
    parameters: Map<String, Value>,
) -> View {
    let mut view = View::new(view_id, app_identifier(), parameters);
    view.new_contain(vocab::TEXT_DOCUMENT, Map::new());
    view.new_contain(vocab::TOKEN, Map::new());
    view.new_contain(
        vocab::TIME_FRAME,
        json_map(json!({"timeUnit": TIME_UNIT, "document": doc_id})),
    );
    view.new_contain(vocab::SENTENCE, Map::new());
    view.new_contain(vocab::ALIGNMENT, Map::new());

    let textdoc_id = "td_1";
    let token_document = format!("{}:{}", view.id, textdoc_id);
    let mut text = String::new();
    let mut char_len = 0usize;
    let mut token_seq = 0usize;
    let mut segment_annotations = vec![];

    for (index, segment) in segments.iter().enumerate() {
        let mut sentence_targets = vec![];
        for word in segment.text.split_whitespace() {
            if char_len > 0 {
                text.push(' ');
                char_len += 1;
            }
            let start = char_len;
            text.push_str(word);
            char_len += word.chars().count();

            token_seq += 1;
            let token_id = format!("t_{token_seq}");
            segment_annotations.push(
                Annotation::new(vocab::TOKEN, &token_id)
                    .prop("word", word)
                    .prop("start", start)
                    .prop("end", char_len)
                    .prop("document", token_document.as_str()),
            );
            sentence_targets.push(token_id);
        }

        let frame_id = format!("tf_{}", index + 1);
        segment_annotations.push(
            Annotation::new(vocab::TIME_FRAME, &frame_id)
                .prop("frameType", "speech")
                .prop("start", to_millis(segment.start))
                .prop("end", to_millis(segment.end)),
        );
        let sentence_id = format!("s_{}", index + 1);
        segment_annotations.push(
            Annotation::new(vocab::SENTENCE, &sentence_id)
                .prop("targets", sentence_targets)
                .prop("text", segment.text.as_str()),
        );
        segment_annotations.push(
            Annotation::new(vocab::ALIGNMENT, &format!("a_{}", index + 2))
                .prop("source", frame_id.as_str())
                .prop("target", sentence_id.as_str()),
        );
    }

    let mut text_value = json_map(json!({"@value": text}));
    if let Some(lang) = language {
        text_value.insert("@language".into(), Value::String(lang.to_string()));
    }
    view.annotations
        .push(Annotation::new(vocab::TEXT_DOCUMENT, textdoc_id).prop("text", text_value));
    view.annotations.push(
        Annotation::new(vocab::ALIGNMENT, "a_1")
            .prop("source", doc_id)
            .prop("target", textdoc_id),
    );
    view.annotations.extend(segment_annotations);
    view
}

fn to_millis(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_segments() -> Vec<TimedSegment> {
        vec![
            TimedSegment {
                start: 0.0,
                end: 2.5,
                text: "hello world".into(),
            },
            TimedSegment {
                start: 2.5,
                end: 4.02,
                text: "again".into(),
            },
        ]
    }

    fn annotations_of<'a>(view: &'a View, at_type: &str) -> Vec<&'a Annotation> {
        view.annotations
            .iter()
            .filter(|a| a.at_type == at_type)
            .collect()
    }

    #[test]
    fn view_carries_full_text_and_source_alignment() {
        let view = transcript_view("v_0".into(), "d1", &fake_segments(), None, Map::new());
        let textdoc = &annotations_of(&view, vocab::TEXT_DOCUMENT)[0];
        assert_eq!(
            textdoc.properties["text"]["@value"],
            Value::String("hello world again".into())
        );
        assert!(textdoc.properties["text"].get("@language").is_none());

        let alignment = &annotations_of(&view, vocab::ALIGNMENT)[0];
        assert_eq!(alignment.properties["source"], "d1");
        assert_eq!(alignment.properties["target"], "td_1");
    }

    #[test]
    fn token_offsets_index_into_the_text_document() {
        let view = transcript_view("v_0".into(), "d1", &fake_segments(), None, Map::new());
        let tokens = annotations_of(&view, vocab::TOKEN);
        let words: Vec<(&str, u64, u64)> = tokens
            .iter()
            .map(|t| {
                (
                    t.properties["word"].as_str().unwrap(),
                    t.properties["start"].as_u64().unwrap(),
                    t.properties["end"].as_u64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            words,
            vec![("hello", 0, 5), ("world", 6, 11), ("again", 12, 17)]
        );
        assert_eq!(
            tokens[0].properties["document"],
            Value::String("v_0:td_1".into())
        );
    }

    #[test]
    fn token_offsets_are_character_based() {
        let segments = vec![TimedSegment {
            start: 0.0,
            end: 1.0,
            text: "héllo wörld".into(),
        }];
        let view = transcript_view("v_0".into(), "d1", &segments, None, Map::new());
        let tokens = annotations_of(&view, vocab::TOKEN);
        assert_eq!(tokens[0].properties["end"].as_u64().unwrap(), 5);
        assert_eq!(tokens[1].properties["start"].as_u64().unwrap(), 6);
        assert_eq!(tokens[1].properties["end"].as_u64().unwrap(), 11);
    }

    #[test]
    fn timeframes_are_milliseconds_and_ordered() {
        let view = transcript_view("v_0".into(), "d1", &fake_segments(), None, Map::new());
        let frames = annotations_of(&view, vocab::TIME_FRAME);
        let spans: Vec<(u64, u64)> = frames
            .iter()
            .map(|f| {
                (
                    f.properties["start"].as_u64().unwrap(),
                    f.properties["end"].as_u64().unwrap(),
                )
            })
            .collect();
        assert_eq!(spans, vec![(0, 2500), (2500, 4020)]);
        assert!(spans.windows(2).all(|w| w[0].1 <= w[1].0));
        for frame in &frames {
            assert_eq!(frame.properties["frameType"], "speech");
        }
        assert_eq!(
            view.metadata.contains[vocab::TIME_FRAME]["timeUnit"],
            TIME_UNIT
        );
    }

    #[test]
    fn sentences_target_their_tokens() {
        let view = transcript_view("v_0".into(), "d1", &fake_segments(), None, Map::new());
        let sentences = annotations_of(&view, vocab::SENTENCE);
        assert_eq!(sentences.len(), 2);
        assert_eq!(
            sentences[0].properties["targets"],
            serde_json::json!(["t_1", "t_2"])
        );
        assert_eq!(sentences[1].properties["targets"], serde_json::json!(["t_3"]));
        assert_eq!(sentences[1].properties["text"], "again");

        // each sentence is aligned to its time frame
        let alignments = annotations_of(&view, vocab::ALIGNMENT);
        assert_eq!(alignments[1].properties["source"], "tf_1");
        assert_eq!(alignments[1].properties["target"], "s_1");
    }

    #[test]
    fn empty_segments_produce_no_transcript_annotations() {
        let view = transcript_view("v_0".into(), "d1", &[], None, Map::new());
        assert!(annotations_of(&view, vocab::TIME_FRAME).is_empty());
        assert!(annotations_of(&view, vocab::TOKEN).is_empty());
        assert!(annotations_of(&view, vocab::SENTENCE).is_empty());
        assert!(view.metadata.error.is_none());
        let textdoc = &annotations_of(&view, vocab::TEXT_DOCUMENT)[0];
        assert_eq!(textdoc.properties["text"]["@value"], "");
    }

    #[test]
    fn language_hint_is_recorded_on_the_text_document() {
        let view = transcript_view("v_0".into(), "d1", &fake_segments(), Some("en"), Map::new());
        let textdoc = &annotations_of(&view, vocab::TEXT_DOCUMENT)[0];
        assert_eq!(textdoc.properties["text"]["@language"], "en");
    }

    #[test]
    fn params_map_keeps_only_given_parameters() {
        let params = RuntimeParams {
            model_size: Some("tiny".into()),
            model_lang: None,
            task: None,
            pretty: Some(true),
        };
        let map = params.as_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["modelSize"], "tiny");
        assert_eq!(map["pretty"], true);
    }
}
