//! Reduces a fragment sequence to the final answer and its references.
//!
//! The completed fragment carries its steps as a JSON string, and the FINAL
//! step's `content.answer` is usually JSON-encoded a second time. When that
//! nested parse fails the raw `answer` string is the answer, with no
//! references. Nothing here panics or returns an error: every failure is
//! logged and degrades to an empty or partial answer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ExtractionError;
use crate::fragment::{Fragment, is_completed};

/// A web result cited by the answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerResult {
    pub text: String,
    pub references: Vec<Reference>,
}

impl AnswerResult {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Find the first completed fragment with usable steps and pull out its answer.
pub fn extract<'a, I>(fragments: I) -> AnswerResult
where
    I: IntoIterator<Item = &'a Fragment>,
{
    for (index, fragment) in fragments.into_iter().enumerate() {
        let payload = &fragment.payload;
        if !is_completed(payload) {
            continue;
        }
        let Some(steps) = payload.get("text") else {
            continue;
        };

        match answer_from_steps(steps) {
            Ok(result) => return result,
            Err(ExtractionError::NoFinalStep) => {
                debug!(index, "completed fragment has no FINAL step");
                return AnswerResult::default();
            }
            Err(err) => {
                debug!(index, error = %err, "skipping unusable completed fragment");
            }
        }
    }
    AnswerResult::default()
}

fn answer_from_steps(steps: &Value) -> Result<AnswerResult, ExtractionError> {
    let decoded;
    let steps = match steps {
        Value::String(raw) => {
            decoded = serde_json::from_str::<Value>(raw)
                .map_err(|e| ExtractionError::Steps(e.to_string()))?;
            &decoded
        }
        other => other,
    };
    let steps = steps
        .as_array()
        .ok_or_else(|| ExtractionError::Steps("not an array".into()))?;

    for step in steps {
        let step = step.as_object().ok_or(ExtractionError::StepShape)?;
        if step.get("step_type").and_then(Value::as_str) != Some("FINAL") {
            continue;
        }
        let Some(content) = step.get("content") else {
            continue;
        };
        let content = content.as_object().ok_or(ExtractionError::StepShape)?;
        return Ok(match content.get("answer") {
            Some(answer) => parse_answer(answer),
            None => AnswerResult::default(),
        });
    }
    Err(ExtractionError::NoFinalStep)
}

fn parse_answer(answer: &Value) -> AnswerResult {
    match answer {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(data)) => from_answer_data(&data),
            Ok(_) | Err(_) => {
                debug!("answer is not nested JSON, using it verbatim");
                AnswerResult {
                    text: raw.clone(),
                    references: Vec::new(),
                }
            }
        },
        Value::Object(data) => from_answer_data(data),
        other => AnswerResult {
            text: scalar_text(other),
            references: Vec::new(),
        },
    }
}

fn from_answer_data(data: &Map<String, Value>) -> AnswerResult {
    let text = data.get("answer").map(scalar_text).unwrap_or_default();
    let references = data
        .get("web_results")
        .and_then(Value::as_array)
        .map(|results| results.iter().filter_map(reference).collect())
        .unwrap_or_default();
    AnswerResult { text, references }
}

fn reference(value: &Value) -> Option<Reference> {
    let object = value.as_object()?;
    let field = |key: &str| {
        object
            .get(key)
            .map(scalar_text)
            .unwrap_or_default()
    };
    Some(Reference {
        name: field("name"),
        url: field("url"),
    })
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
