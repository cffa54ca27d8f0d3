use serde::Serialize;
use serde_json::{json, Value};

use crate::mmif::{vocab, MMIF_VERSION};

/// Time unit used for all TimeFrame annotations this app emits.
pub const TIME_UNIT: &str = "milliseconds";

pub fn app_identifier() -> String {
    format!(
        "http://apps.clams.ai/whisper-wrapper/v{}",
        env!("CARGO_PKG_VERSION")
    )
}

#[derive(Serialize, Debug)]
pub struct AppMetadata {
    pub name: &'static str,
    pub description: &'static str,
    pub app_version: &'static str,
    pub mmif_version: &'static str,
    pub app_license: &'static str,
    pub identifier: String,
    pub url: &'static str,
    pub analyzer_version: &'static str,
    pub analyzer_license: &'static str,
    pub input: Vec<Value>,
    pub output: Vec<Value>,
    pub parameters: Vec<Parameter>,
}

#[derive(Serialize, Debug)]
pub struct Parameter {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub multivalued: bool,
}

pub fn app_metadata() -> AppMetadata {
    AppMetadata {
        name: "Whisper Wrapper",
        description: "A CLAMS wrapper for Whisper-based ASR, running on the \
                      candle implementation of the OpenAI Whisper models.",
        app_version: env!("CARGO_PKG_VERSION"),
        mmif_version: MMIF_VERSION,
        app_license: "Apache 2.0",
        identifier: app_identifier(),
        url: "https://github.com/clamsproject/whisper-wrapper-rs",
        analyzer_version: "0.6.0",
        analyzer_license: "MIT",
        input: vec![
            // one required document, audio or video
            json!([
                {"@type": vocab::AUDIO_DOCUMENT, "required": true},
                {"@type": vocab::VIDEO_DOCUMENT, "required": true}
            ]),
        ],
        output: vec![
            json!({"@type": vocab::TEXT_DOCUMENT}),
            json!({"@type": vocab::TIME_FRAME, "properties": {"timeUnit": TIME_UNIT}}),
            json!({"@type": vocab::ALIGNMENT}),
            json!({"@type": vocab::TOKEN}),
            json!({"@type": vocab::SENTENCE}),
        ],
        parameters: vec![
            Parameter {
                name: "modelSize",
                description: "The size of the model to use (also can be given as alias: \
                              tiny=t, base=b, small=s, medium=m, large=l).",
                kind: "string",
                choices: Some(vec![
                    "tiny", "t", "base", "b", "small", "s", "medium", "m", "large", "l",
                ]),
                default: Some(json!("tiny")),
                multivalued: false,
            },
            Parameter {
                name: "modelLang",
                description: "Language of the model to use, accepts two- or three-letter \
                              ISO 639 language codes. A two-letter region suffix (e.g. \
                              \"en-US\") is tolerated for recording purposes but ignored. \
                              When not given, the first seconds of the audio are used to \
                              detect the language.",
                kind: "string",
                choices: None,
                default: Some(json!("")),
                multivalued: false,
            },
            Parameter {
                name: "task",
                description: "(from whisper CLI) whether to perform X->X speech \
                              recognition ('transcribe') or X->English translation \
                              ('translate').",
                kind: "string",
                choices: Some(vec!["transcribe", "translate"]),
                default: Some(json!("transcribe")),
                multivalued: false,
            },
            Parameter {
                name: "pretty",
                description: "The JSON body of the HTTP response will be re-formatted \
                              with 2-space indentation.",
                kind: "boolean",
                choices: None,
                default: Some(json!(false)),
                multivalued: false,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_declares_io_and_parameters() {
        let meta = app_metadata();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["name"], "Whisper Wrapper");
        assert!(json["identifier"]
            .as_str()
            .unwrap()
            .starts_with("http://apps.clams.ai/whisper-wrapper/v"));
        // input is a oneof group of audio and video
        assert_eq!(json["input"][0].as_array().unwrap().len(), 2);
        assert_eq!(json["output"].as_array().unwrap().len(), 5);
        let names: Vec<&str> = meta.parameters.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["modelSize", "modelLang", "task", "pretty"]);
    }

    #[test]
    fn model_size_parameter_accepts_aliases() {
        let meta = app_metadata();
        let sizes = meta.parameters[0].choices.as_ref().unwrap();
        for alias in ["t", "b", "s", "m", "l"] {
            assert!(sizes.contains(&alias));
        }
    }
}
