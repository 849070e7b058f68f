//! HTTP clients for the multimodal verification and transcription APIs.
//!
//! Both talk to an OpenAI-compatible inference endpoint: verification via
//! chat completions with an image part and strict-JSON response format,
//! transcription via the multipart audio endpoint.

use async_trait::async_trait;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::adapters::{AudioData, ImageData, TranscriptionAdapter, Verdict, VerificationAdapter};
use crate::error::{Error, Result};
use crate::model::template::{SopTemplate, Step};
use crate::sequencer;

/// Verification client against an OpenAI-compatible multimodal endpoint.
pub struct HttpVerificationAdapter {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl HttpVerificationAdapter {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

fn adapter_err(message: impl std::fmt::Display) -> Error {
    Error::Adapter {
        adapter: "verification",
        message: message.to_string(),
    }
}

/// Render the full template for the prompt: tasks, steps, hazards, in
/// canonical order, so the model can judge sequence position.
fn render_template(template: &SopTemplate) -> String {
    let mut out = format!("Procedure: {}\n", template.title);
    for (task_idx, task) in template.tasks.iter().enumerate() {
        out.push_str(&format!("\nTask {}: {}\n", task_idx + 1, task.title));
        if let Some(desc) = &task.description {
            out.push_str(&format!("  Description: {desc}\n"));
        }
        for (step_idx, step) in task.steps.iter().enumerate() {
            out.push_str(&format!(
                "  Step {}.{}: {}\n",
                task_idx + 1,
                step_idx + 1,
                step.description
            ));
            if let Some(action) = &step.expected_action {
                out.push_str(&format!("    Action: {action}\n"));
            }
            if let Some(result) = &step.expected_result {
                out.push_str(&format!("    Result: {result}\n"));
            }
            for hazard in &step.hazards {
                out.push_str(&format!(
                    "    Hazard [{}]: {}\n",
                    hazard.severity, hazard.description
                ));
            }
        }
    }
    out
}

fn build_prompt(step: &Step, template: &SopTemplate, transcript: &str) -> Result<String> {
    let (task_no, step_no) = sequencer::position_of(template, step.id)?;
    let hazards = if step.hazards.is_empty() {
        "None specified".to_string()
    } else {
        step.hazards
            .iter()
            .map(|h| format!("{}: {}", h.severity, h.description))
            .collect::<Vec<_>>()
            .join(", ")
    };

    Ok(format!(
        "You are verifying that a worker correctly performed a safety step.\n\n\
         Complete workflow:\n{workflow}\n\n\
         Current expected step (Task {task_no}, Step {step_no}): {description}\n\
         Expected action: {action}\n\
         Expected result: {result}\n\
         Known hazards: {hazards}\n\n\
         Worker evidence:\n\
         - Spoken confirmation transcript: \"{transcript}\"\n\
         - Image: attached\n\n\
         Determine:\n\
         1. Did the worker perform the correct action for THIS step?\n\
         2. Does the image show the expected result?\n\
         3. Based on the complete workflow, is the worker on the correct step,\n\
            or did they skip or repeat one? Set step_sequence_correct accordingly.\n\
         4. Are there visible safety concerns?\n\n\
         Be strict with safety-critical steps. Give specific corrections on\n\
         failure and concrete praise on success. Respond with JSON only.",
        workflow = render_template(template),
        description = step.description,
        action = step.expected_action.as_deref().unwrap_or("N/A"),
        result = step.expected_result.as_deref().unwrap_or("N/A"),
    ))
}

fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "result": {"type": "string", "enum": ["pass", "fail"]},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "step_sequence_correct": {"type": "boolean"},
            "feedback": {"type": "string"},
            "reasoning": {"type": "string"},
            "next_step_hint": {"type": "string"}
        },
        "required": ["result", "confidence", "step_sequence_correct", "feedback", "reasoning"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    result: String,
    confidence: f64,
    step_sequence_correct: bool,
    feedback: String,
    reasoning: String,
    next_step_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl VerificationAdapter for HttpVerificationAdapter {
    async fn verify(
        &self,
        image: &ImageData,
        transcript: &str,
        step: &Step,
        template: &SopTemplate,
    ) -> Result<Verdict> {
        let prompt = build_prompt(step, template, transcript)?;
        let image_url = format!(
            "data:{};base64,{}",
            image.media_type,
            base64::engine::general_purpose::STANDARD.encode(&image.bytes)
        );

        let payload = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image_url}}
                ]
            }],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "verdict",
                    "strict": true,
                    "schema": response_schema()
                }
            }
        });

        debug!(model = %self.model, step = %step.id, "sending verification request");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(adapter_err)?
            .error_for_status()
            .map_err(adapter_err)?;

        let body: ChatResponse = response.json().await.map_err(adapter_err)?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| adapter_err("response contained no choices"))?;

        let raw: RawVerdict = serde_json::from_str(content)
            .map_err(|e| adapter_err(format!("unparseable verdict JSON: {e}")))?;

        if !(0.0..=1.0).contains(&raw.confidence) {
            return Err(adapter_err(format!(
                "confidence out of range: {}",
                raw.confidence
            )));
        }

        Ok(Verdict {
            pass: raw.result == "pass",
            confidence: raw.confidence,
            sequence_correct: raw.step_sequence_correct,
            feedback: raw.feedback,
            reasoning: raw.reasoning,
            next_step_hint: raw.next_step_hint,
        })
    }
}

/// Whisper-style transcription client.
pub struct HttpTranscriptionAdapter {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl HttpTranscriptionAdapter {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl TranscriptionAdapter for HttpTranscriptionAdapter {
    async fn transcribe(&self, audio: &AudioData) -> Result<String> {
        let err = |message: String| Error::Adapter {
            adapter: "transcription",
            message,
        };

        let part = reqwest::multipart::Part::bytes(audio.bytes.clone())
            .file_name("evidence.webm")
            .mime_str(&audio.media_type)
            .map_err(|e| err(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| err(e.to_string()))?
            .error_for_status()
            .map_err(|e| err(e.to_string()))?;

        let body: TranscriptionResponse =
            response.json().await.map_err(|e| err(e.to_string()))?;
        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn prompt_includes_full_workflow_and_hazards() {
        let mut t = SopTemplate::new("Line shutdown", Uuid::new_v4());
        let task = t.add_task("Isolate");
        {
            let step = task.add_step("Close main valve");
            step.expected_action = Some("Turn handle fully clockwise".into());
            step.hazards.push(crate::model::template::Hazard {
                description: "Residual pressure".into(),
                severity: "high".into(),
                mitigation: None,
            });
        }
        task.add_step("Verify gauge");

        let first = sequencer::first_step(&t).unwrap().clone();
        let prompt = build_prompt(&first, &t, "valve closed, check").unwrap();

        assert!(prompt.contains("Line shutdown"));
        assert!(prompt.contains("Task 1, Step 1"));
        assert!(prompt.contains("Turn handle fully clockwise"));
        assert!(prompt.contains("high: Residual pressure"));
        assert!(prompt.contains("Verify gauge"));
        assert!(prompt.contains("valve closed, check"));
    }

    #[test]
    fn verdict_json_parses() {
        let raw = r#"{
            "result": "fail",
            "confidence": 0.82,
            "step_sequence_correct": false,
            "feedback": "The valve is still open.",
            "reasoning": "Handle position visible in image.",
            "next_step_hint": null
        }"#;
        let v: RawVerdict = serde_json::from_str(raw).unwrap();
        assert_eq!(v.result, "fail");
        assert!(!v.step_sequence_correct);
        assert!(v.next_step_hint.is_none());
    }
}
