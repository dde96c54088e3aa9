//! Bounded conversation context with token accounting, conservative anaphora
//! resolution, and optional newline-delimited-JSON persistence.
//!
//! The store is purely synchronous: it never suspends. The dispatch loop is
//! the single writer; LM requests receive cloned snapshots via
//! [`ConversationContext::messages_for_llm`].

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::{Message, MessageRole};

/// Rough per-message overhead (role + framing) in tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimate tokens for a text with the ~4-characters-per-token heuristic.
///
/// Precision is not required: the backend re-tokenizes, this only drives
/// trimming decisions.
pub fn estimate_text_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

fn estimate_message_tokens(msg: &Message) -> usize {
    let call_len: usize = msg
        .tool_calls
        .iter()
        .map(|c| c.name.len() + c.arguments.to_string().len())
        .sum();
    estimate_text_tokens(&msg.content) + (call_len + 3) / 4 + MESSAGE_OVERHEAD_TOKENS
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Limits and persistence settings for a conversation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget over retained messages (system prompt included).
    pub max_tokens: usize,
    /// Hard cap on the number of retained non-system messages.
    pub max_messages: usize,
    /// When set, appended messages are also written to this newline-delimited
    /// JSON file and reloaded on construction.
    pub persist_path: Option<PathBuf>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 16_000,
            max_messages: 50,
            persist_path: None,
        }
    }
}

// ─── Referents ───────────────────────────────────────────────────────────────

/// The most recently referenced entities, used for anaphora resolution.
#[derive(Debug, Clone, Default)]
struct ReferentSet {
    file: Option<String>,
    dir: Option<String>,
    url: Option<String>,
    tool_result: Option<String>,
}

// ─── ConversationContext ─────────────────────────────────────────────────────

/// Ordered message store with a protected system prompt.
///
/// Invariant: after every `append`, the token estimate over retained messages
/// is within `max_tokens` and the message count within `max_messages`, except
/// that the system prompt and the most recent user message are never evicted.
pub struct ConversationContext {
    system_prompt: Message,
    messages: VecDeque<Message>,
    config: ContextConfig,
    working_dir: Option<PathBuf>,
    referents: ReferentSet,
}

impl ConversationContext {
    /// Create a context with the given system prompt. When the config names a
    /// persist path, previously persisted messages are reloaded (capped at
    /// `max_messages`, then re-trimmed).
    pub fn new(system_prompt: impl Into<String>, config: ContextConfig) -> Self {
        let mut ctx = Self {
            system_prompt: Message::system(system_prompt),
            messages: VecDeque::new(),
            config,
            working_dir: None,
            referents: ReferentSet::default(),
        };
        if let Some(path) = ctx.config.persist_path.clone() {
            ctx.reload_from(&path);
        }
        ctx
    }

    // ── Core operations ──────────────────────────────────────────────────────

    /// Append a message and re-establish the size bounds.
    pub fn append(&mut self, message: Message) {
        self.record_referents(&message);
        self.persist_line(&message);
        self.messages.push_back(message);
        self.trim();
    }

    /// Snapshot for an LM request: system prompt first, then the retained
    /// messages in insertion order.
    pub fn messages_for_llm(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(self.system_prompt.clone());
        out.extend(self.messages.iter().cloned());
        out
    }

    /// Drop all conversation messages and referents. Idempotent; the system
    /// prompt survives. The persistence file, when configured, is truncated.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.referents = ReferentSet::default();
        if let Some(path) = &self.config.persist_path {
            if let Err(e) = fs::write(path, b"") {
                log::warn!("context: failed to truncate persist file: {e}");
            }
        }
    }

    /// Total token estimate over the system prompt and retained messages.
    pub fn estimate_tokens(&self) -> usize {
        estimate_message_tokens(&self.system_prompt)
            + self.messages.iter().map(estimate_message_tokens).sum::<usize>()
    }

    /// Number of retained non-system messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Set the working directory; also records it as the current directory
    /// referent for "there"-style references.
    pub fn set_working_dir(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.referents.dir = Some(path.to_string_lossy().into_owned());
        self.working_dir = Some(path);
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Evict the oldest unprotected messages beyond a fraction of the budget.
    /// Used by the dispatch loop to recover once from a context-too-long
    /// rejection; returns how many messages were dropped.
    pub fn shrink_for_retry(&mut self) -> usize {
        let target = self.config.max_tokens / 2;
        let mut dropped = 0;
        while self.estimate_tokens() > target {
            if !self.evict_oldest_unprotected() {
                break;
            }
            dropped += 1;
        }
        dropped
    }

    // ── Reference resolution ─────────────────────────────────────────────────

    /// Conservatively substitute anaphora in user text.
    ///
    /// Only the exact tokens "it", "that", "this", "the file", and "there" are
    /// candidate anchors, and only when a referent of matching type has been
    /// recorded. "the file" prefers the recorded file and falls back to the
    /// recorded URL when no file is known. The bare pronouns resolve only
    /// when exactly one of {file, URL} is recorded; with both known they are
    /// ambiguous and the text is returned unchanged. Ambiguity never errors.
    pub fn resolve_references(&self, text: &str) -> String {
        let mut out = text.to_string();

        if let Some(file_like) = self.referents.file.as_ref().or(self.referents.url.as_ref()) {
            out = replace_word(&out, "the file", file_like);
        }
        if let Some(dir) = &self.referents.dir {
            out = replace_word(&out, "there", dir);
        }

        let pronoun_target = match (&self.referents.file, &self.referents.url) {
            (Some(file), None) => Some(file),
            (None, Some(url)) => Some(url),
            // Both or neither recorded: no unambiguous referent.
            _ => None,
        };
        if let Some(target) = pronoun_target {
            for anchor in ["it", "that", "this"] {
                out = replace_word(&out, anchor, target);
            }
        }

        out
    }

    // ── Referent recording ───────────────────────────────────────────────────

    /// Record the most recent tool-result text (exposed for tooling that runs
    /// outside `append`).
    pub fn note_tool_result(&mut self, text: impl Into<String>) {
        self.referents.tool_result = Some(text.into());
    }

    /// The most recent tool-result text, if any.
    pub fn last_tool_result(&self) -> Option<&str> {
        self.referents.tool_result.as_deref()
    }

    fn record_referents(&mut self, message: &Message) {
        match message.role {
            MessageRole::Assistant => {
                for call in &message.tool_calls {
                    if let Some(args) = call.arguments.as_object() {
                        for (key, value) in args {
                            let Some(s) = value.as_str() else { continue };
                            let key = key.to_lowercase();
                            if key == "url" || s.starts_with("http://") || s.starts_with("https://")
                            {
                                self.referents.url = Some(s.to_string());
                            } else if key.contains("dir") || key.contains("directory") {
                                self.referents.dir = Some(s.to_string());
                            } else if key.contains("path") || key.contains("file") {
                                self.referents.file = Some(s.to_string());
                            }
                        }
                    }
                }
            }
            MessageRole::Tool => {
                self.referents.tool_result = Some(message.content.clone());
            }
            _ => {}
        }
    }

    // ── Trimming ─────────────────────────────────────────────────────────────

    fn over_budget(&self) -> bool {
        self.estimate_tokens() > self.config.max_tokens
            || self.messages.len() > self.config.max_messages
    }

    fn trim(&mut self) {
        while self.over_budget() {
            if !self.evict_oldest_unprotected() {
                break;
            }
        }
    }

    /// Drop the oldest message that is not the most recent user message.
    /// Returns `false` when nothing evictable remains.
    fn evict_oldest_unprotected(&mut self) -> bool {
        let last_user = self
            .messages
            .iter()
            .rposition(|m| m.role == MessageRole::User);
        let victim = (0..self.messages.len()).find(|&i| Some(i) != last_user);
        match victim {
            Some(i) => {
                self.messages.remove(i);
                true
            }
            None => false,
        }
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    fn persist_line(&self, message: &Message) {
        let Some(path) = &self.config.persist_path else {
            return;
        };
        let line = match serde_json::to_string(message) {
            Ok(l) => l,
            Err(e) => {
                log::warn!("context: failed to serialize message for persistence: {e}");
                return;
            }
        };
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            // A persistence failure must never reach the dispatch loop.
            log::warn!("context: failed to persist message: {e}");
        }
    }

    fn reload_from(&mut self, path: &Path) {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(_) => return, // nothing persisted yet
        };
        let restored: Vec<Message> = BufReader::new(file)
            .lines()
            .map_while(|l| l.ok())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect();
        let skip = restored.len().saturating_sub(self.config.max_messages);
        self.messages.extend(restored.into_iter().skip(skip));
        // Rebuild referents from the retained window only.
        let retained: Vec<Message> = self.messages.iter().cloned().collect();
        for msg in &retained {
            self.record_referents(msg);
        }
        self.trim();
        log::debug!("context: restored {} message(s) from {}", self.messages.len(), path.display());
    }
}

/// Replace whole-word (or whole-phrase) occurrences of `needle`,
/// case-sensitively, leaving substrings of larger words untouched.
fn replace_word(haystack: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.find(needle) {
        let before_ok = rest[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = rest[pos + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        out.push_str(&rest[..pos]);
        if before_ok && after_ok {
            out.push_str(replacement);
        } else {
            out.push_str(needle);
        }
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}
