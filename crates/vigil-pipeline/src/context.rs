//! Per-call conversation state.
//!
//! One `CallContext` per live call, owned by that call's pipeline worker.
//! External code never touches it directly; snapshots flow out through
//! pipeline events.

use crate::clients::{IntentContext, PersonalityProfile, VoiceProfile};
use std::collections::VecDeque;
use vigil_core::types::{CallId, Intent, now_ms};

/// Conversation state accumulated over one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Owning call.
    pub call_id: CallId,
    /// Call start (ms since epoch).
    pub started_at: u64,
    /// Speech chunks observed so far.
    pub message_count: u32,
    /// Recent transcripts, oldest first, bounded.
    pub recent_transcripts: VecDeque<String>,
    /// Recent intents, oldest first, bounded.
    pub recent_intents: VecDeque<Intent>,
    /// Reply personality for this user.
    pub personality: PersonalityProfile,
    /// Synthesis voice for this user.
    pub voice: VoiceProfile,
    window: usize,
}

impl CallContext {
    /// Create context for a new call with a bounded history window.
    #[must_use]
    pub fn new(call_id: &str, window: usize) -> Self {
        Self {
            call_id: call_id.to_string(),
            started_at: now_ms(),
            message_count: 0,
            recent_transcripts: VecDeque::new(),
            recent_intents: VecDeque::new(),
            personality: PersonalityProfile::default(),
            voice: VoiceProfile::default(),
            window: window.max(1),
        }
    }

    /// Record a recognized speech message.
    pub fn record_transcript(&mut self, text: &str) {
        self.message_count += 1;
        self.recent_transcripts.push_back(text.to_string());
        while self.recent_transcripts.len() > self.window {
            self.recent_transcripts.pop_front();
        }
    }

    /// Record a classified intent.
    pub fn record_intent(&mut self, intent: Intent) {
        self.recent_intents.push_back(intent);
        while self.recent_intents.len() > self.window {
            self.recent_intents.pop_front();
        }
    }

    /// Call duration so far in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at)
    }

    /// Build the classifier context snapshot.
    #[must_use]
    pub fn intent_context(&self) -> IntentContext {
        IntentContext {
            recent_transcripts: self.recent_transcripts.iter().cloned().collect(),
            recent_intents: self.recent_intents.iter().cloned().collect(),
            call_duration_ms: self.duration_ms(),
            message_count: self.message_count,
        }
    }
}
