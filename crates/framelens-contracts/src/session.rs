use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{AnalysisResult, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Wire name expected by the backend's `contents` array.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// A follow-up conversation about one analyzed asset.
///
/// The session is an owned value: the full transcript lives here, and every
/// mutation goes through [`Session::continue_from`] or
/// [`Session::record_exchange`]. There is no backend-held handle; each turn
/// re-sends the transcript, which is why the seed carries only the narrative
/// conclusion of the analysis and never the original media or taxonomy
/// payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub model: String,
    pub kind: MediaKind,
    transcript: Vec<Turn>,
}

impl Session {
    /// Seeds a new session from a freshly produced analysis: one user turn
    /// restating that an initial analysis exists, one model turn embedding
    /// the full narrative as shared context.
    pub fn continue_from(kind: MediaKind, result: &AnalysisResult, model: impl Into<String>) -> Self {
        let transcript = vec![
            Turn {
                role: Role::User,
                text: format!(
                    "I've provided {}, and you've generated an initial analysis. \
                     Now, please answer my follow-up questions about it.",
                    kind.noun_phrase()
                ),
            },
            Turn {
                role: Role::Model,
                text: format!(
                    "Of course. Here is the analysis I generated for your reference. \
                     I am ready for your questions.\n\n{}",
                    result.analysis
                ),
            },
        ];
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            kind,
            transcript,
        }
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// Records one completed user/model exchange. Called only after a turn
    /// succeeds, so a failed turn leaves the transcript untouched and the
    /// caller may retry the same message.
    pub fn record_exchange(&mut self, user_text: impl Into<String>, model_text: impl Into<String>) {
        self.transcript.push(Turn {
            role: Role::User,
            text: user_text.into(),
        });
        self.transcript.push(Turn {
            role: Role::Model,
            text: model_text.into(),
        });
    }
}
