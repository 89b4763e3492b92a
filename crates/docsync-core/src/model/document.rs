use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docsync_api::types::DocumentDto;

use super::entity_id::EntityId;

// ── ProcessingState ─────────────────────────────────────────────────

/// Server-side processing lifecycle of an uploaded document.
///
/// States only move forward. `merge` makes applying the same update
/// twice, or seeing progress jump straight to a terminal state, safe:
/// duplicates are absorbed and nothing ever regresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ProcessingState {
    Queued,
    Processing { percent: u8 },
    Ready,
    Failed { reason: String },
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Processing { .. } => 1,
            Self::Ready | Self::Failed { .. } => 2,
        }
    }

    /// Monotonic merge of an incoming state into the current one.
    ///
    /// A terminal state is final; between two `Processing` states the
    /// higher percentage wins; otherwise the further-along state wins.
    pub fn merge(current: &Self, incoming: Self) -> Self {
        if current.is_terminal() {
            return current.clone();
        }
        if let (Self::Processing { percent: a }, Self::Processing { percent: b }) =
            (current, &incoming)
        {
            return Self::Processing {
                percent: (*a).max(*b),
            };
        }
        if incoming.rank() >= current.rank() {
            incoming
        } else {
            current.clone()
        }
    }
}

// ── Document ────────────────────────────────────────────────────────

/// An uploaded file attached to a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: EntityId,
    pub chat_id: EntityId,
    pub name: String,
    pub size_bytes: u64,
    pub processing: ProcessingState,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A locally created document awaiting upload confirmation.
    pub fn draft(chat_id: EntityId, name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: EntityId::temp(),
            chat_id,
            name: name.into(),
            size_bytes,
            processing: ProcessingState::Queued,
            updated_at: Utc::now(),
        }
    }
}

impl From<DocumentDto> for Document {
    fn from(dto: DocumentDto) -> Self {
        let processing = match dto.status.as_str() {
            "processing" => ProcessingState::Processing {
                percent: dto.progress.unwrap_or(0),
            },
            "ready" => ProcessingState::Ready,
            "failed" => ProcessingState::Failed {
                reason: dto.error.unwrap_or_else(|| "processing failed".into()),
            },
            // "queued" and anything unrecognized start at the beginning
            _ => ProcessingState::Queued,
        };

        Self {
            id: EntityId::Server(dto.id),
            chat_id: EntityId::Server(dto.chat_id),
            name: dto.name,
            size_bytes: dto.size_bytes,
            processing,
            updated_at: dto.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_never_regresses() {
        let current = ProcessingState::Processing { percent: 50 };
        let merged = ProcessingState::merge(&current, ProcessingState::Processing { percent: 30 });
        assert_eq!(merged, ProcessingState::Processing { percent: 50 });
    }

    #[test]
    fn terminal_state_is_final() {
        let merged = ProcessingState::merge(
            &ProcessingState::Ready,
            ProcessingState::Processing { percent: 99 },
        );
        assert_eq!(merged, ProcessingState::Ready);

        let failed = ProcessingState::Failed {
            reason: "parse error".into(),
        };
        let merged = ProcessingState::merge(&failed, ProcessingState::Ready);
        assert_eq!(merged, failed);
    }

    #[test]
    fn progress_may_jump_straight_to_terminal() {
        let current = ProcessingState::Processing { percent: 10 };
        let merged = ProcessingState::merge(&current, ProcessingState::Ready);
        assert_eq!(merged, ProcessingState::Ready);
    }

    #[test]
    fn duplicate_merge_is_idempotent() {
        let current = ProcessingState::Queued;
        let step = ProcessingState::Processing { percent: 50 };
        let once = ProcessingState::merge(&current, step.clone());
        let twice = ProcessingState::merge(&once, step);
        assert_eq!(once, twice);
    }
}
