//! Feedback audio: empathic TTS client and filesystem audio storage.

use async_trait::async_trait;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

use crate::adapters::{AudioStore, SpeechAdapter};
use crate::error::{Error, Result};
use crate::model::session::{CheckId, SessionId};

fn adapter_err(message: impl std::fmt::Display) -> Error {
    Error::Adapter {
        adapter: "speech",
        message: message.to_string(),
    }
}

/// TTS client for a Hume-style synthesis endpoint. Sends utterances,
/// receives base64 audio generations.
pub struct HttpSpeechAdapter {
    http: reqwest::Client,
    endpoint: String,
    voice_id: Option<String>,
    api_key: SecretString,
}

impl HttpSpeechAdapter {
    pub fn new(endpoint: impl Into<String>, voice_id: Option<String>, api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            voice_id,
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    generations: Vec<Generation>,
}

#[derive(Debug, Deserialize)]
struct Generation {
    /// Base64-encoded audio.
    audio: String,
}

#[async_trait]
impl SpeechAdapter for HttpSpeechAdapter {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut utterance = serde_json::json!({ "text": text });
        if let Some(voice) = &self.voice_id {
            utterance["voice"] = serde_json::json!({ "id": voice });
        }

        debug!(text_len = text.len(), "requesting speech synthesis");

        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Hume-Api-Key", self.api_key.expose_secret())
            .json(&serde_json::json!({ "utterances": [utterance] }))
            .send()
            .await
            .map_err(adapter_err)?
            .error_for_status()
            .map_err(adapter_err)?;

        let body: SynthesisResponse = response.json().await.map_err(adapter_err)?;
        let generation = body
            .generations
            .first()
            .ok_or_else(|| adapter_err("no audio generations returned"))?;

        base64::engine::general_purpose::STANDARD
            .decode(&generation.audio)
            .map_err(|e| adapter_err(format!("bad base64 audio: {e}")))
    }
}

/// Stores feedback audio as files under a base directory. The returned
/// reference is the file path, one file per check.
pub struct FsAudioStore {
    base_dir: PathBuf,
}

impl FsAudioStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl AudioStore for FsAudioStore {
    async fn put(
        &self,
        session_id: SessionId,
        check_id: CheckId,
        bytes: &[u8],
    ) -> Result<String> {
        let dir = self.base_dir.join(session_id.0.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| adapter_err(format!("create audio dir: {e}")))?;

        let path = dir.join(format!("{}.mp3", check_id.0));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| adapter_err(format!("write audio file: {e}")))?;

        Ok(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_writes_one_file_per_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAudioStore::new(dir.path());

        let session = SessionId::new();
        let check = CheckId::new();
        let reference = store.put(session, check, b"mp3-bytes").await.unwrap();

        let written = tokio::fs::read(&reference).await.unwrap();
        assert_eq!(written, b"mp3-bytes");
        assert!(reference.contains(&session.0.to_string()));
    }
}
