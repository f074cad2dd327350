//! In-process fallback store
//!
//! A single mutex over a map of pre-encoded payloads. Expiry is lazy (checked
//! on access) with an optional periodic sweep; capacity is bounded, reclaiming
//! expired entries first and then the oldest insertion.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    seq: u64,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct LocalInner {
    entries: HashMap<String, LocalEntry>,
    next_seq: u64,
    evictions: u64,
}

#[derive(Debug)]
pub struct LocalStore {
    max_entries: usize,
    inner: Mutex<LocalInner>,
}

impl LocalStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(LocalInner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        inner.entries.remove(key);
        None
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.max_entries {
            Self::make_room(&mut inner, now);
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: ttl.map(|d| now + d),
                seq,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every live key matching `pattern`; returns how many were removed.
    pub fn clear_pattern(&self, pattern: &str) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut removed = 0;
        inner.entries.retain(|key, entry| {
            if !glob_match(pattern, key) {
                return true;
            }
            if !entry.is_expired(now) {
                removed += 1;
            }
            false
        });
        removed
    }

    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop all expired entries; returns how many were purged.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    /// Live (unexpired) entry count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    fn make_room(inner: &mut LocalInner, now: Instant) {
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        if inner.entries.len() < before {
            return;
        }

        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| e.seq)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.evictions += 1;
        }
    }
}

/// Redis-style key pattern (`*`, `?`, `[abc]`, `[a-z]`, `[^a]`, `\` escapes)
/// matched with `glob::Pattern`. Patterns that cannot be compiled match
/// nothing.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match glob::Pattern::new(&to_glob_syntax(pattern)) {
        Ok(compiled) => compiled.matches(text),
        Err(e) => {
            debug!(pattern, error = %e, "Unusable key pattern");
            false
        }
    }
}

/// Rewrite Redis pattern syntax into `glob` syntax.
fn to_glob_syntax(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                // `**` is recursive in glob; a run of stars is one star here
                out.push('*');
                while i + 1 < chars.len() && chars[i + 1] == '*' {
                    i += 1;
                }
            }
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&glob::Pattern::escape(&chars[i].to_string()));
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut j = i + 1;
                    if chars[j] == '^' || chars[j] == '!' {
                        out.push('!');
                        j += 1;
                    }
                    while j < end {
                        if chars[j] == '\\' && j + 1 < end {
                            j += 1;
                        }
                        out.push(chars[j]);
                        j += 1;
                    }
                    out.push(']');
                    i = end;
                }
                // Unterminated class: literal bracket
                None => out.push_str("[[]"),
            },
            ']' => out.push_str("[]]"),
            c => out.push(c),
        }
        i += 1;
    }
    out
}

/// Index of the `]` closing the class opened at `chars[start]`.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if j < chars.len() && (chars[j] == '^' || chars[j] == '!') {
        j += 1;
    }
    // A leading `]` belongs to the class
    if j < chars.len() && chars[j] == ']' {
        j += 1;
    }
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            ']' => return Some(j),
            _ => j += 1,
        }
    }
    None
}
