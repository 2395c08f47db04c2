//! Typed surface of the formatting worker's JSON-RPC methods, and the
//! high-level service that ties supervision, formatting calls, and edit
//! reconciliation together.
//!
//! The worker exposes two methods:
//!
//! - `format(params) -> {formatted[, cursorOffset]} | {ignored: true} |
//!   {missingParser: true} | {error: {name, message, stack}}`
//! - `hasConfig(params) -> boolean`
//!
//! The module path, parser identifier, options map, and ignore-file path are
//! all resolved by external configuration logic and opaque here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::reconcile::{apply_reconciled, reconcile, ApplyOutcome, EditorBuffer, Selection};
use crate::supervisor::{WorkerError, WorkerSupervisor};

/// Documents larger than this are rejected before any RPC call is made.
pub const MAX_DOCUMENT_SIZE: usize = 32 * 1024 * 1024;

/// Worker method names.
pub mod methods {
    pub const FORMAT: &str = "format";
    pub const HAS_CONFIG: &str = "hasConfig";
}

/// Parameters for the `format` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatParams {
    /// The document snapshot to format.
    pub original: String,
    /// Path used by the engine to resolve its configuration.
    pub path_for_config: String,
    /// Ignore-file path, when one applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_path: Option<String>,
    /// Flat engine options (parser identifier included), opaque to the
    /// coordinator.
    pub options: BTreeMap<String, Value>,
    /// Cursor offset for cursor-aware formatting, when supported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_cursor: Option<usize>,
}

/// A structured error reported by the formatting engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Result of a `format` call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FormatOutcome {
    /// The engine reported a structured failure.
    Error { error: EngineError },
    /// The document is excluded by the engine's ignore rules.
    Ignored { ignored: bool },
    /// No parser is available for this document.
    #[serde(rename_all = "camelCase")]
    MissingParser { missing_parser: bool },
    /// Formatted text, with the mapped cursor when requested and supported.
    #[serde(rename_all = "camelCase")]
    Formatted {
        formatted: String,
        #[serde(default)]
        cursor_offset: Option<usize>,
    },
}

/// Formatting-level errors surfaced to the editor integration.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The document exceeds [`MAX_DOCUMENT_SIZE`]; no RPC call was made.
    #[error("Document size {size} exceeds maximum {MAX_DOCUMENT_SIZE} bytes")]
    DocumentTooLarge { size: usize },

    /// The worker is unavailable or the call failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The engine has no parser for this document.
    #[error("No parser available for this document")]
    MissingParser,

    /// The engine reported a structured failure (often with a resolvable
    /// source location in `message`).
    #[error("Formatting engine error {name}: {message}")]
    Engine {
        name: String,
        message: String,
        stack: Option<String>,
    },

    /// The worker's response did not match the expected shape.
    #[error("Malformed response from formatting worker: {0}")]
    MalformedResponse(String),

    /// Applying the reconciled edits to the buffer failed.
    #[error("Failed to apply formatted edits: {0}")]
    Apply(String),
}

/// High-level formatting interface over a supervised worker.
///
/// Callers hold this as their only capability to the worker; the supervisor
/// (and through it the process and channel) is exclusively owned here.
pub struct FormattingService {
    supervisor: WorkerSupervisor,
}

impl FormattingService {
    pub fn new(supervisor: WorkerSupervisor) -> Self {
        Self { supervisor }
    }

    /// Access the underlying supervisor (lifecycle control).
    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Format a document snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::DocumentTooLarge`] before any RPC call when
    /// the snapshot exceeds the size ceiling, and [`FormatError::Worker`]
    /// when the worker is down or the call fails.
    pub async fn format(&self, params: FormatParams) -> Result<FormatOutcome, FormatError> {
        let size = params.original.len();
        if size > MAX_DOCUMENT_SIZE {
            return Err(FormatError::DocumentTooLarge { size });
        }

        let params = serde_json::to_value(&params)
            .map_err(|e| FormatError::MalformedResponse(e.to_string()))?;
        let response = self.supervisor.request(methods::FORMAT, params).await?;
        let outcome: FormatOutcome = serde_json::from_value(response)
            .map_err(|e| FormatError::MalformedResponse(e.to_string()))?;

        // The marker variants are meaningful only when their flag is true;
        // a false flag is not a valid reply shape.
        match outcome {
            FormatOutcome::Ignored { ignored: false } => Err(FormatError::MalformedResponse(
                "ignored flag must be true".to_string(),
            )),
            FormatOutcome::MissingParser {
                missing_parser: false,
            } => Err(FormatError::MalformedResponse(
                "missingParser flag must be true".to_string(),
            )),
            outcome => Ok(outcome),
        }
    }

    /// Ask the engine whether a configuration file governs this path.
    pub async fn has_config(&self, path_for_config: &str) -> Result<bool, FormatError> {
        let response = self
            .supervisor
            .request(
                methods::HAS_CONFIG,
                json!({ "pathForConfig": path_for_config }),
            )
            .await?;
        response
            .as_bool()
            .ok_or_else(|| FormatError::MalformedResponse("expected a boolean".to_string()))
    }

    /// Format and reconcile the result into the live buffer.
    ///
    /// `selections` are the caller's live selection ranges over the
    /// snapshot. An ignored document is a quiet no-op; drift (the buffer
    /// changed while formatting was in flight) discards the result without
    /// touching the buffer.
    pub async fn format_and_apply<B: EditorBuffer + ?Sized>(
        &self,
        buffer: &mut B,
        params: FormatParams,
        selections: &[Selection],
    ) -> Result<ApplyOutcome, FormatError> {
        let original = params.original.clone();
        match self.format(params).await? {
            FormatOutcome::Formatted {
                formatted,
                cursor_offset,
            } => {
                let reconciled = reconcile(&original, &formatted, selections);
                apply_reconciled(buffer, &original, &formatted, &reconciled, cursor_offset)
                    .map_err(|e| FormatError::Apply(e.to_string()))
            }
            FormatOutcome::Ignored { .. } => {
                debug!("document ignored by engine configuration");
                Ok(ApplyOutcome::Unchanged)
            }
            FormatOutcome::MissingParser { .. } => Err(FormatError::MissingParser),
            FormatOutcome::Error { error } => Err(FormatError::Engine {
                name: error.name,
                message: error.message,
                stack: error.stack,
            }),
        }
    }
}
