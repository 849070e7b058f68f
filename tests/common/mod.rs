//! Shared harness for integration tests: scripted adapters over the
//! in-memory store, with short deadlines so timeout paths run fast.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use kakunin::adapters::{
    AudioData, AudioStore, Evidence, ImageData, SpeechAdapter, TranscriptionAdapter, Verdict,
    VerificationAdapter,
};
use kakunin::audit::AuditLedger;
use kakunin::error::{Error, Result};
use kakunin::model::session::{CheckId, SessionId, WorkSession};
use kakunin::model::template::{SopTemplate, Step, StepId};
use kakunin::orchestrator::{Adapters, CheckOrchestrator, OrchestratorConfig, SessionLocks};
use kakunin::store::memory::MemoryStore;
use kakunin::store::{SessionStore, TemplateStore};

// ---------------------------------------------------------------------------
// Verdict helpers
// ---------------------------------------------------------------------------

pub fn pass_verdict(confidence: f64) -> Verdict {
    Verdict {
        pass: true,
        confidence,
        sequence_correct: true,
        feedback: "Step completed correctly.".to_string(),
        reasoning: "Evidence matches the expected result.".to_string(),
        next_step_hint: None,
    }
}

pub fn fail_verdict(confidence: f64) -> Verdict {
    Verdict {
        pass: false,
        confidence,
        sequence_correct: true,
        feedback: "The valve is still open.".to_string(),
        reasoning: "Image shows the handle in the open position.".to_string(),
        next_step_hint: None,
    }
}

pub fn out_of_sequence(mut verdict: Verdict) -> Verdict {
    verdict.sequence_correct = false;
    verdict
}

// ---------------------------------------------------------------------------
// Scripted adapters
// ---------------------------------------------------------------------------

pub enum VerifyScript {
    Verdict(Verdict),
    Error,
    /// Sleeps past the configured deadline.
    Hang,
}

/// Pops one script entry per call; an empty script verifies as a
/// high-confidence pass. Records the transcript seen by each call.
pub struct MockVerifier {
    script: Mutex<VecDeque<VerifyScript>>,
    pub transcripts: Mutex<Vec<String>>,
}

impl MockVerifier {
    pub fn scripted(items: Vec<VerifyScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(items.into()),
            transcripts: Mutex::new(Vec::new()),
        })
    }

    pub fn always_pass() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub async fn last_transcript(&self) -> Option<String> {
        self.transcripts.lock().await.last().cloned()
    }
}

#[async_trait]
impl VerificationAdapter for MockVerifier {
    async fn verify(
        &self,
        _image: &ImageData,
        transcript: &str,
        _step: &Step,
        _template: &SopTemplate,
    ) -> Result<Verdict> {
        self.transcripts.lock().await.push(transcript.to_string());
        match self.script.lock().await.pop_front() {
            None => Ok(pass_verdict(0.95)),
            Some(VerifyScript::Verdict(v)) => Ok(v),
            Some(VerifyScript::Error) => Err(Error::Adapter {
                adapter: "verification",
                message: "upstream returned 503".to_string(),
            }),
            Some(VerifyScript::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(pass_verdict(0.95))
            }
        }
    }
}

pub enum TranscribeMode {
    Text(String),
    Error,
    Hang,
}

pub struct MockTranscriber {
    mode: TranscribeMode,
}

impl MockTranscriber {
    pub fn text(s: &str) -> Arc<Self> {
        Arc::new(Self {
            mode: TranscribeMode::Text(s.to_string()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            mode: TranscribeMode::Error,
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            mode: TranscribeMode::Hang,
        })
    }
}

#[async_trait]
impl TranscriptionAdapter for MockTranscriber {
    async fn transcribe(&self, _audio: &AudioData) -> Result<String> {
        match &self.mode {
            TranscribeMode::Text(s) => Ok(s.clone()),
            TranscribeMode::Error => Err(Error::Adapter {
                adapter: "transcription",
                message: "decode failed".to_string(),
            }),
            TranscribeMode::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }
        }
    }
}

pub struct MockSpeech {
    ok: bool,
}

impl MockSpeech {
    pub fn working() -> Arc<Self> {
        Arc::new(Self { ok: true })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { ok: false })
    }
}

#[async_trait]
impl SpeechAdapter for MockSpeech {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        if self.ok {
            Ok(vec![0u8; 16])
        } else {
            Err(Error::Adapter {
                adapter: "speech",
                message: "voice unavailable".to_string(),
            })
        }
    }
}

/// Stores nothing, remembers every put.
#[derive(Default)]
pub struct MockAudioStore {
    pub puts: Mutex<Vec<(SessionId, CheckId)>>,
}

#[async_trait]
impl AudioStore for MockAudioStore {
    async fn put(
        &self,
        session_id: SessionId,
        check_id: CheckId,
        _bytes: &[u8],
    ) -> Result<String> {
        self.puts.lock().await.push((session_id, check_id));
        Ok(format!("mem://{}/{}", session_id.0, check_id.0))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub orchestrator: CheckOrchestrator,
    pub ledger: AuditLedger,
    pub template: SopTemplate,
    /// Flattened step ids: two in the first task, one in the second.
    pub steps: Vec<StepId>,
    pub audio: Arc<MockAudioStore>,
}

pub fn three_step_template() -> (SopTemplate, Vec<StepId>) {
    let mut template = SopTemplate::new("Pump maintenance", Uuid::new_v4());
    let prep = template.add_task("Preparation");
    let a = prep.add_step("Close the intake valve").id;
    let b = prep.add_step("Verify pressure gauge reads zero").id;
    let exec = template.add_task("Service");
    let c = exec.add_step("Replace the filter cartridge").id;
    (template, vec![a, b, c])
}

pub async fn harness_with(
    verifier: Arc<MockVerifier>,
    transcriber: Arc<MockTranscriber>,
    speech: Arc<MockSpeech>,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let (template, steps) = three_step_template();
    TemplateStore::insert(store.as_ref(), &template)
        .await
        .unwrap();

    let audio = Arc::new(MockAudioStore::default());
    let adapters = Adapters {
        verifier,
        transcriber,
        speech,
        audio: audio.clone(),
    };
    let config = OrchestratorConfig {
        verify_timeout: Duration::from_millis(50),
        transcribe_timeout: Duration::from_millis(50),
        speech_timeout: Duration::from_millis(50),
    };

    let sessions: Arc<dyn SessionStore> = store.clone();
    let templates: Arc<dyn TemplateStore> = store.clone();
    let locks = Arc::new(SessionLocks::new());

    let orchestrator = CheckOrchestrator::new(
        sessions.clone(),
        templates.clone(),
        adapters,
        locks.clone(),
        config,
    );
    let ledger = AuditLedger::new(sessions, templates, locks);

    Harness {
        store,
        orchestrator,
        ledger,
        template,
        steps,
        audio,
    }
}

pub async fn harness(verifier: Arc<MockVerifier>) -> Harness {
    harness_with(verifier, MockTranscriber::text("confirmed"), MockSpeech::working()).await
}

impl Harness {
    pub async fn start(&self) -> WorkSession {
        self.orchestrator
            .start_session(self.template.id, Uuid::new_v4())
            .await
            .unwrap()
    }

    pub async fn reload(&self, session: &WorkSession) -> WorkSession {
        SessionStore::get(self.store.as_ref(), session.id)
            .await
            .unwrap()
    }
}

pub fn image_evidence() -> Evidence {
    Evidence {
        image: ImageData {
            bytes: vec![0xFF, 0xD8, 0xFF],
            media_type: "image/jpeg".to_string(),
        },
        audio: None,
        transcript: None,
    }
}

pub fn evidence_with_transcript(text: &str) -> Evidence {
    Evidence {
        transcript: Some(text.to_string()),
        ..image_evidence()
    }
}

pub fn evidence_with_audio() -> Evidence {
    Evidence {
        audio: Some(AudioData {
            bytes: vec![0x1A, 0x45],
            media_type: "audio/webm".to_string(),
        }),
        ..image_evidence()
    }
}
