//! External adapter boundaries: verification, transcription, speech.
//!
//! All three are treated as unreliable. The orchestrator owns the policy
//! for what happens when they fail; implementations here just report
//! failures as `Error::Adapter`.

pub mod speech;
pub mod vision;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::session::{CheckId, SessionId};
use crate::model::template::{SopTemplate, Step};

/// Image evidence. Required for every check.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    /// MIME type, e.g. "image/jpeg".
    pub media_type: String,
}

/// Audio evidence, transcribed before verification.
#[derive(Debug, Clone)]
pub struct AudioData {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

/// Evidence submitted for one check: image required, audio preferred over
/// a pre-supplied transcript, both optional (a silent check is permitted).
#[derive(Debug, Clone)]
pub struct Evidence {
    pub image: ImageData,
    pub audio: Option<AudioData>,
    pub transcript: Option<String>,
}

/// What the verification adapter concluded about the evidence.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub pass: bool,
    pub confidence: f64,
    /// Whether the worker appears to be on the expected step. Produced
    /// entirely by the adapter; the engine honors it as an opaque boolean.
    pub sequence_correct: bool,
    pub feedback: String,
    pub reasoning: String,
    pub next_step_hint: Option<String>,
}

/// Judges evidence against the expected step. The full template goes along
/// so the adapter can flag skipped or repeated steps.
#[async_trait]
pub trait VerificationAdapter: Send + Sync {
    async fn verify(
        &self,
        image: &ImageData,
        transcript: &str,
        step: &Step,
        template: &SopTemplate,
    ) -> Result<Verdict>;
}

/// Turns audio evidence into text.
#[async_trait]
pub trait TranscriptionAdapter: Send + Sync {
    async fn transcribe(&self, audio: &AudioData) -> Result<String>;
}

/// Renders feedback text to audio bytes.
#[async_trait]
pub trait SpeechAdapter: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Persists synthesized feedback audio and returns a reference to it.
#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn put(&self, session_id: SessionId, check_id: CheckId, bytes: &[u8])
    -> Result<String>;
}
