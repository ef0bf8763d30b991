pub mod completion;
pub mod config;
pub mod error;
pub mod stores;

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use image::ImageFormat;
use mathdesk_contracts::events::{EventLog, FailureClass, SessionEvent};
use mathdesk_contracts::messages::{ChatMessage, ContentPart, ImageReference};
use mathdesk_contracts::models::{ModelSelection, ModelSelector};
use mathdesk_contracts::sessions::summary::{write_summary, SessionSummary};
use reqwest::blocking::Client as HttpClient;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use completion::{CompletionService, DryrunChatService, OpenAiChatService, TEMPERATURE};
pub use config::{AppConfig, ConfigOverrides, KeyScheme};
pub use error::{ServiceError, StoreError, TurnError, TurnResult};
pub use stores::{
    GatewayObjectStore, ImageStore, InlineImageStore, LocalImageStore, S3ObjectStore,
};

use crate::error::error_chain_text;

pub const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that solves math problems. Respond in Markdown.";
pub const IMAGE_LABEL: &str = "Solve this problem:";
pub const EXIT_SENTINEL: &str = "exit";
pub const UPLOAD_CONTENT_TYPE: &str = "image/png";

const VISION_CAPABILITY: &str = "vision";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    ImageAttached,
    /// Between acceptance of a submission and the service's reply. Seen by
    /// `TurnRenderer::render_pending`.
    AwaitingResponse,
    Terminated,
}

/// Per-session conversation state. One instance per session, never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationTurnState {
    attached_image: Option<ImageReference>,
    submission_sequence: u64,
    last_user_text: Option<String>,
    awaiting_response: bool,
    terminated: bool,
}

impl ConversationTurnState {
    pub fn attached_image(&self) -> Option<&ImageReference> {
        self.attached_image.as_ref()
    }

    /// Number of accepted submissions; also the identity of the next input.
    pub fn submission_sequence(&self) -> u64 {
        self.submission_sequence
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.last_user_text.as_deref()
    }

    pub fn phase(&self) -> TurnPhase {
        if self.terminated {
            TurnPhase::Terminated
        } else if self.awaiting_response {
            TurnPhase::AwaitingResponse
        } else if self.attached_image.is_some() {
            TurnPhase::ImageAttached
        } else {
            TurnPhase::Idle
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Answered { sequence: u64, answer: String },
    Rejected,
    Terminated,
}

/// Render sink of the UI layer.
pub trait TurnRenderer {
    fn render_assistant_message(&mut self, markdown: &str);
    fn render_error(&mut self, message: &str);
    fn render_warning(&mut self, message: &str);

    /// A submission was accepted and the service is being asked.
    fn render_pending(&mut self, _sequence: u64) {}
}

enum Accepted {
    Terminated,
    Rejected,
    Pending {
        sequence: u64,
        messages: Vec<ChatMessage>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct TurnCounters {
    turns_failed: u64,
    turns_rejected: u64,
    uploads_succeeded: u64,
    uploads_failed: u64,
}

pub struct TurnController {
    session_id: String,
    state: ConversationTurnState,
    store: Box<dyn ImageStore>,
    completion: Box<dyn CompletionService>,
    model: String,
    model_selector: ModelSelector,
    key_scheme: KeyScheme,
    events: Option<EventLog>,
    counters: TurnCounters,
    started_at: String,
}

impl TurnController {
    pub fn new(
        session_id: impl Into<String>,
        store: Box<dyn ImageStore>,
        completion: Box<dyn CompletionService>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state: ConversationTurnState::default(),
            store,
            completion,
            model: model.into(),
            model_selector: ModelSelector::default(),
            key_scheme: KeyScheme::Namespaced,
            events: None,
            counters: TurnCounters::default(),
            started_at: now_utc_iso(),
        }
    }

    pub fn with_key_scheme(mut self, key_scheme: KeyScheme) -> Self {
        self.key_scheme = key_scheme;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds a session from validated configuration, logging to
    /// `{session_dir}/events.jsonl`.
    pub fn from_config(config: &AppConfig, session_dir: &Path) -> TurnResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(session_dir).map_err(|err| {
            TurnError::Config(format!("failed creating {}: {err}", session_dir.display()))
        })?;
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| TurnError::Config(format!("failed building HTTP client: {err}")))?;
        let store = stores::image_store_from_config(config, session_dir, http.clone())?;
        let completion = completion::completion_service_from_config(config, http)?;

        let session_id = session_id_for(session_dir);
        let events = EventLog::create(session_dir.join("events.jsonl"), session_id.clone())
            .map_err(|err| TurnError::Config(format!("failed opening session log: {err:#}")))?;
        let mut controller = Self::new(session_id, store, completion, String::new())
            .with_key_scheme(config.key_scheme)
            .with_events(events);
        controller.emit(SessionEvent::SessionStarted {
            session_dir: session_dir.to_string_lossy().to_string(),
            store: controller.store.name().to_string(),
            completion: controller.completion.name().to_string(),
        });
        controller.select_model(config.model.as_deref())?;
        Ok(controller)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &ConversationTurnState {
        &self.state
    }

    pub fn phase(&self) -> TurnPhase {
        self.state.phase()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Picks a vision-capable model served by the active completion service.
    /// A request it cannot honor is replaced by that service's default and
    /// the reason is returned in the selection.
    pub fn select_model(&mut self, requested: Option<&str>) -> TurnResult<ModelSelection> {
        let selection = self
            .model_selector
            .select(requested, self.completion.name(), VISION_CAPABILITY)
            .map_err(TurnError::Config)?;
        self.model = selection.model.name.clone();
        match selection.fallback_reason.as_deref() {
            Some(reason) => warn!(model = %self.model, reason, "requested chat model replaced"),
            None => debug!(model = %self.model, "chat model selected"),
        }
        self.emit(SessionEvent::ModelSelected {
            model: selection.model.name.clone(),
            provider: selection.model.provider.clone(),
            requested: selection.requested.clone(),
            fallback_reason: selection.fallback_reason.clone(),
        });
        Ok(selection)
    }

    /// Stores an uploaded image and makes it the session's attachment.
    ///
    /// Only PNG and JPEG are accepted; the image is re-encoded as PNG before
    /// it reaches the store. On any failure the previous attachment stays.
    pub fn handle_upload(&mut self, bytes: &[u8], file_name: &str) -> TurnResult<ImageReference> {
        if self.state.terminated {
            return Err(TurnError::Terminated);
        }
        match self.store_upload(bytes, file_name) {
            Ok((reference, digest)) => {
                self.state.attached_image = Some(reference.clone());
                self.counters.uploads_succeeded += 1;
                info!(file_name, kind = reference.kind(), "image attached");
                self.emit(SessionEvent::ImageAttached {
                    file_name: file_name.to_string(),
                    store: self.store.name().to_string(),
                    kind: reference.kind().to_string(),
                    reference: reference.display_label(),
                    sha256: digest,
                });
                Ok(reference)
            }
            Err(err) => {
                self.counters.uploads_failed += 1;
                warn!(file_name, error = %err, "image upload failed");
                self.emit(SessionEvent::UploadFailed {
                    file_name: file_name.to_string(),
                    store: self.store.name().to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn store_upload(&self, bytes: &[u8], file_name: &str) -> TurnResult<(ImageReference, String)> {
        let png =
            normalize_upload(bytes).map_err(|err| TurnError::Store(error_chain_text(&err, 512)))?;
        let digest = sha256_hex(&png);
        let key = stores::storage_key(
            self.key_scheme,
            &self.session_id,
            file_name,
            chrono::Utc::now().timestamp_millis(),
        );
        let reference = self
            .store
            .put(&key, &png, UPLOAD_CONTENT_TYPE)
            .map_err(|err| TurnError::Store(error_chain_text(&err, 512)))?;
        Ok((reference, digest))
    }

    /// Runs one submission through the turn state machine.
    ///
    /// `exit` (any case) ends the session; empty text without an attachment is
    /// dropped without touching state. Otherwise the sequence advances before
    /// the request is sent and stays advanced if the request fails.
    pub fn handle_submit(&mut self, raw_text: &str) -> TurnResult<SubmitOutcome> {
        match self.accept_submission(raw_text)? {
            Accepted::Terminated => Ok(SubmitOutcome::Terminated),
            Accepted::Rejected => Ok(SubmitOutcome::Rejected),
            Accepted::Pending { sequence, messages } => {
                self.complete_submission(sequence, &messages)
            }
        }
    }

    fn accept_submission(&mut self, raw_text: &str) -> TurnResult<Accepted> {
        if self.state.terminated {
            return Err(TurnError::Terminated);
        }

        if raw_text.trim().eq_ignore_ascii_case(EXIT_SENTINEL) {
            self.state.terminated = true;
            info!(session_id = %self.session_id, "session terminated");
            self.emit(SessionEvent::SessionTerminated {
                submission_sequence: self.state.submission_sequence,
            });
            return Ok(Accepted::Terminated);
        }

        if raw_text.is_empty() && self.state.attached_image.is_none() {
            self.counters.turns_rejected += 1;
            self.emit(SessionEvent::TurnRejected {
                reason: "empty".to_string(),
            });
            return Ok(Accepted::Rejected);
        }

        self.state.submission_sequence += 1;
        let sequence = self.state.submission_sequence;
        self.state.last_user_text = if raw_text.is_empty() {
            None
        } else {
            Some(raw_text.to_string())
        };
        let messages = build_messages(raw_text, self.state.attached_image.as_ref());
        self.emit(SessionEvent::TurnSubmitted {
            sequence,
            model: self.model.clone(),
            messages: messages.len(),
            has_text: !raw_text.is_empty(),
            has_image: self.state.attached_image.is_some(),
        });
        self.state.awaiting_response = true;
        Ok(Accepted::Pending { sequence, messages })
    }

    fn complete_submission(
        &mut self,
        sequence: u64,
        messages: &[ChatMessage],
    ) -> TurnResult<SubmitOutcome> {
        let result = self.completion.complete(&self.model, messages, TEMPERATURE);
        self.state.awaiting_response = false;

        match result {
            Ok(answer) => {
                self.emit(SessionEvent::AssistantMessage {
                    sequence,
                    chars: answer.chars().count(),
                });
                Ok(SubmitOutcome::Answered { sequence, answer })
            }
            Err(err) => {
                let err = classify_completion_error(&err);
                self.counters.turns_failed += 1;
                warn!(sequence, error = %err, "turn failed");
                let class = match err {
                    TurnError::Service(_) => FailureClass::Service,
                    _ => FailureClass::Unexpected,
                };
                self.emit(SessionEvent::TurnFailed {
                    sequence,
                    class,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// UI trigger for an uploaded file. Failures are rendered as warnings.
    pub fn on_image_uploaded(
        &mut self,
        bytes: &[u8],
        file_name: &str,
        renderer: &mut dyn TurnRenderer,
    ) -> Option<ImageReference> {
        match self.handle_upload(bytes, file_name) {
            Ok(reference) => Some(reference),
            Err(TurnError::Terminated) => {
                renderer.render_error(&turn_error_message(&TurnError::Terminated));
                None
            }
            Err(err) => {
                renderer.render_warning(&format!("Failed to upload image: {err}"));
                None
            }
        }
    }

    /// UI trigger for the send button. Renders exactly one answer or error
    /// per accepted submission and returns the phase afterwards.
    pub fn on_submit_clicked(&mut self, text: &str, renderer: &mut dyn TurnRenderer) -> TurnPhase {
        let result = match self.accept_submission(text) {
            Ok(Accepted::Pending { sequence, messages }) => {
                renderer.render_pending(sequence);
                self.complete_submission(sequence, &messages)
            }
            Ok(Accepted::Terminated) => Ok(SubmitOutcome::Terminated),
            Ok(Accepted::Rejected) => Ok(SubmitOutcome::Rejected),
            Err(err) => Err(err),
        };
        render_submit_result(&result, renderer);
        self.phase()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            turns_submitted: self.state.submission_sequence,
            turns_failed: self.counters.turns_failed,
            turns_rejected: self.counters.turns_rejected,
            uploads_succeeded: self.counters.uploads_succeeded,
            uploads_failed: self.counters.uploads_failed,
            attachment_kind: self
                .state
                .attached_image
                .as_ref()
                .map(|reference| reference.kind().to_string()),
            terminated: self.state.terminated,
        }
    }

    /// Writes the session summary and the closing event.
    pub fn finish(&self, summary_path: &Path) -> anyhow::Result<SessionSummary> {
        let summary = self.summary();
        let mut extra = Map::new();
        extra.insert("model".to_string(), Value::String(self.model.clone()));
        write_summary(summary_path, &summary, Some(&extra))?;
        if let Some(events) = self.events.as_ref() {
            events.append(SessionEvent::SessionFinished {
                turns_submitted: summary.turns_submitted,
                turns_failed: summary.turns_failed,
                summary_path: summary_path.to_string_lossy().to_string(),
            })?;
        }
        Ok(summary)
    }

    // Event log failures never fail a turn.
    fn emit(&self, event: SessionEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let kind = event.kind();
        if let Err(err) = events.append(event) {
            warn!(event = kind, error = %err, "failed writing session event");
        }
    }
}

/// Renders the result of one submission: the answer, or an error naming
/// whether the service or something else failed. Rejected and terminating
/// submissions render nothing.
pub fn render_submit_result(result: &TurnResult<SubmitOutcome>, renderer: &mut dyn TurnRenderer) {
    match result {
        Ok(SubmitOutcome::Answered { answer, .. }) => renderer.render_assistant_message(answer),
        Ok(SubmitOutcome::Rejected | SubmitOutcome::Terminated) => {}
        Err(err) => renderer.render_error(&turn_error_message(err)),
    }
}

fn turn_error_message(err: &TurnError) -> String {
    match err {
        TurnError::Service(message) => format!("The math assistant failed to respond: {message}"),
        TurnError::Unexpected(message) => format!("An unexpected error occurred: {message}"),
        TurnError::Terminated => "The session has ended.".to_string(),
        other => format!("An unexpected error occurred: {other}"),
    }
}

/// Assembles the request for one turn: the system persona, the user's text
/// when present, then the attached image (if any) under a fixed label.
pub fn build_messages(text: &str, attached_image: Option<&ImageReference>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    if !text.is_empty() {
        messages.push(ChatMessage::user_text(text));
    }
    if let Some(reference) = attached_image {
        messages.push(ChatMessage::user_parts(vec![
            ContentPart::text(IMAGE_LABEL),
            ContentPart::image(reference),
        ]));
    }
    messages
}

fn classify_completion_error(err: &anyhow::Error) -> TurnError {
    let message = error_chain_text(err, 512);
    let from_service = err.chain().any(|cause| {
        cause.downcast_ref::<ServiceError>().is_some()
            || cause.downcast_ref::<reqwest::Error>().is_some()
    });
    if from_service {
        TurnError::Service(message)
    } else {
        TurnError::Unexpected(message)
    }
}

fn normalize_upload(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    if bytes.is_empty() {
        return Err(StoreError::Unsupported("empty upload".to_string()).into());
    }
    let format = image::guess_format(bytes)
        .map_err(|_| StoreError::Unsupported("unrecognized image data".to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(StoreError::Unsupported(format!(
            "{format:?} images are not accepted (png or jpeg only)"
        ))
        .into());
    }
    let decoded = image::load_from_memory_with_format(bytes, format)
        .context("failed decoding uploaded image")?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("failed re-encoding upload as png")?;
    Ok(png)
}

fn session_id_for(session_dir: &Path) -> String {
    let from_dir = session_dir
        .file_name()
        .and_then(|value| value.to_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    from_dir.unwrap_or_else(|| format!("session-{}", Uuid::new_v4()))
}

/// Fresh directory name for a session under `root`.
pub fn new_session_dir(root: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    root.join(format!("session-{stamp}-{}", &suffix[..8]))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
