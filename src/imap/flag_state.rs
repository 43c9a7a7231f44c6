// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-folder UID and flag bookkeeping.
//!
//! A [`FlagUidState`] is owned by the folder and outlives any one connection.
//! Protocol threads write to it as FETCH/EXPUNGE responses arrive; other
//! threads read it at any time. Every accessor takes the one internal lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use crate::imap::types::MessageFlags;

#[derive(Debug, Default)]
struct Inner {
    uids: Vec<u32>,
    flags: Vec<MessageFlags>,
    index: HashMap<u32, usize>,
    keywords: HashMap<u32, Vec<String>>,
    attributes: HashMap<(u32, String), String>,
    deleted: usize,
    uid_validity: Option<u32>,
    permanent: MessageFlags,
}

impl Inner {
    fn upsert(&mut self, uid: u32, flags: MessageFlags) {
        match self.index.get(&uid) {
            Some(&pos) => {
                let old = self.flags[pos];
                if old.contains(MessageFlags::DELETED) {
                    self.deleted -= 1;
                }
                self.flags[pos] = flags;
            }
            None => {
                self.index.insert(uid, self.uids.len());
                self.uids.push(uid);
                self.flags.push(flags);
            }
        }
        if flags.contains(MessageFlags::DELETED) {
            self.deleted += 1;
        }
    }

    fn remove_at(&mut self, pos: usize) -> u32 {
        let uid = self.uids.remove(pos);
        let flags = self.flags.remove(pos);
        if flags.contains(MessageFlags::DELETED) {
            self.deleted -= 1;
        }
        self.index.remove(&uid);
        for (offset, later) in self.uids[pos..].iter().enumerate() {
            self.index.insert(*later, pos + offset);
        }
        self.keywords.remove(&uid);
        self.attributes.retain(|(owner, _), _| *owner != uid);
        uid
    }
}

#[derive(Debug, Default)]
pub struct FlagUidState {
    inner: Mutex<Inner>,
}

impl FlagUidState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `flags` for `uid`, appending the UID if it is new.
    pub fn set_flags(&self, uid: u32, flags: MessageFlags) {
        self.lock().upsert(uid, flags);
    }

    /// Positional update from an untagged FETCH. `seq` is the 1-based message
    /// sequence number; a UID seen at a new position is appended.
    pub fn set_flags_at(&self, seq: u32, uid: u32, flags: MessageFlags) {
        let mut inner = self.lock();
        let pos = seq.saturating_sub(1) as usize;
        if !inner.index.contains_key(&uid) && pos < inner.uids.len() {
            trace!(
                "FETCH for seq {} carries unknown uid {} (had {})",
                seq,
                uid,
                inner.uids[pos]
            );
        }
        inner.upsert(uid, flags);
    }

    /// Returns the flags of `uid` and whether it is known.
    pub fn get_flags(&self, uid: u32) -> (MessageFlags, bool) {
        let inner = self.lock();
        match inner.index.get(&uid) {
            Some(&pos) => (inner.flags[pos], true),
            None => (MessageFlags::empty(), false),
        }
    }

    pub fn highest_non_deleted_uid(&self) -> Option<u32> {
        let inner = self.lock();
        inner
            .uids
            .iter()
            .zip(inner.flags.iter())
            .filter(|(_, flags)| !flags.contains(MessageFlags::DELETED))
            .map(|(uid, _)| *uid)
            .max()
    }

    pub fn deleted_count(&self) -> usize {
        self.lock().deleted
    }

    /// Applies an untagged EXPUNGE. Returns the UID that was removed.
    pub fn expunge_sequence(&self, seq: u32) -> Option<u32> {
        let mut inner = self.lock();
        let pos = (seq as usize).checked_sub(1)?;
        if pos >= inner.uids.len() {
            debug!("EXPUNGE {} beyond {} known messages", seq, inner.uids.len());
            return None;
        }
        Some(inner.remove_at(pos))
    }

    pub fn expunge_uid(&self, uid: u32) -> bool {
        let mut inner = self.lock();
        match inner.index.get(&uid).copied() {
            Some(pos) => {
                inner.remove_at(pos);
                true
            }
            None => false,
        }
    }

    /// Forgets every message, e.g. after a UIDVALIDITY change.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let permanent = inner.permanent;
        *inner = Inner {
            permanent,
            ..Inner::default()
        };
    }

    /// Stores the folder's UIDVALIDITY, clearing all state when it changed.
    /// Returns true when the previous value differed.
    pub fn set_uid_validity(&self, validity: u32) -> bool {
        let mut inner = self.lock();
        let changed = inner.uid_validity.map_or(false, |old| old != validity);
        if changed {
            debug!("UIDVALIDITY changed to {}, dropping cached flags", validity);
            let permanent = inner.permanent;
            *inner = Inner {
                permanent,
                ..Inner::default()
            };
        }
        inner.uid_validity = Some(validity);
        changed
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.lock().uid_validity
    }

    pub fn uids(&self) -> Vec<u32> {
        self.lock().uids.clone()
    }

    /// UID at a 1-based sequence number.
    pub fn uid_at(&self, seq: u32) -> Option<u32> {
        let inner = self.lock();
        let pos = (seq as usize).checked_sub(1)?;
        inner.uids.get(pos).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds space-separated keywords to `uid`, skipping ones already present.
    pub fn add_custom_flags(&self, uid: u32, keywords: &str) {
        let mut inner = self.lock();
        let entry = inner.keywords.entry(uid).or_default();
        for word in keywords.split_whitespace() {
            if !entry.iter().any(|k| k.eq_ignore_ascii_case(word)) {
                entry.push(word.to_string());
            }
        }
    }

    /// Replaces the keyword list of `uid` with what the server reported.
    pub fn set_custom_flags(&self, uid: u32, keywords: Vec<String>) {
        let mut inner = self.lock();
        if keywords.is_empty() {
            inner.keywords.remove(&uid);
        } else {
            inner.keywords.insert(uid, keywords);
        }
    }

    /// Keywords of `uid` joined by spaces.
    pub fn get_custom_flags(&self, uid: u32) -> Option<String> {
        self.lock()
            .keywords
            .get(&uid)
            .filter(|words| !words.is_empty())
            .map(|words| words.join(" "))
    }

    /// Removes the given space-separated keywords, or all of them when
    /// `keywords` is empty.
    pub fn clear_custom_flags(&self, uid: u32, keywords: &str) {
        let mut inner = self.lock();
        if keywords.trim().is_empty() {
            inner.keywords.remove(&uid);
            return;
        }
        if let Some(entry) = inner.keywords.get_mut(&uid) {
            entry.retain(|k| {
                !keywords
                    .split_whitespace()
                    .any(|word| word.eq_ignore_ascii_case(k))
            });
            if entry.is_empty() {
                inner.keywords.remove(&uid);
            }
        }
    }

    pub fn set_custom_attribute(&self, uid: u32, name: &str, value: &str) {
        self.lock()
            .attributes
            .insert((uid, name.to_string()), value.to_string());
    }

    pub fn get_custom_attribute(&self, uid: u32, name: &str) -> Option<String> {
        self.lock().attributes.get(&(uid, name.to_string())).cloned()
    }

    /// Records the server's PERMANENTFLAGS list.
    pub fn set_permanent_flags<'a, I>(&self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: Vec<&str> = names.into_iter().collect();
        let (mut flags, _) = MessageFlags::from_server_names(names.iter().copied().filter(|n| *n != "\\*"));
        flags.remove(MessageFlags::KEYWORDS);
        flags.set(MessageFlags::KEYWORDS, names.contains(&"\\*"));
        self.lock().permanent = flags;
    }

    /// Flags the server lets us store. `KEYWORDS` means arbitrary keywords are
    /// accepted.
    pub fn supported_user_flags(&self) -> MessageFlags {
        self.lock().permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let state = FlagUidState::new();
        let flags = MessageFlags::SEEN | MessageFlags::FLAGGED;
        state.set_flags(42, flags);
        assert_eq!(state.get_flags(42), (flags, true));
        assert_eq!(state.get_flags(7), (MessageFlags::empty(), false));
    }

    #[test]
    fn test_highest_non_deleted_uid() {
        let state = FlagUidState::new();
        for uid in [1, 2, 3] {
            state.set_flags(uid, MessageFlags::SEEN);
        }
        state.set_flags(5, MessageFlags::DELETED);
        assert_eq!(state.highest_non_deleted_uid(), Some(3));
        assert_eq!(state.deleted_count(), 1);
        assert_eq!(FlagUidState::new().highest_non_deleted_uid(), None);
    }

    #[test]
    fn test_deleted_count_tracks_updates() {
        let state = FlagUidState::new();
        state.set_flags(1, MessageFlags::DELETED);
        state.set_flags(2, MessageFlags::DELETED | MessageFlags::SEEN);
        assert_eq!(state.deleted_count(), 2);
        state.set_flags(1, MessageFlags::SEEN);
        assert_eq!(state.deleted_count(), 1);
        state.set_flags(2, MessageFlags::DELETED);
        assert_eq!(state.deleted_count(), 1);
        assert!(state.expunge_uid(2));
        assert_eq!(state.deleted_count(), 0);
    }

    #[test]
    fn test_expunge_sequence_reindexes() {
        let state = FlagUidState::new();
        for uid in [10, 11, 12, 13] {
            state.set_flags(uid, MessageFlags::empty());
        }
        state.add_custom_flags(11, "$Work");
        state.set_custom_attribute(11, "X-Priority", "1");
        assert_eq!(state.expunge_sequence(2), Some(11));
        assert_eq!(state.uids(), vec![10, 12, 13]);
        assert_eq!(state.uid_at(2), Some(12));
        assert_eq!(state.get_flags(13).1, true);
        assert!(state.get_custom_flags(11).is_none());
        assert!(state.get_custom_attribute(11, "X-Priority").is_none());
        assert_eq!(state.expunge_sequence(9), None);
        assert_eq!(state.expunge_sequence(0), None);
        // The moved entries are still addressable by UID.
        assert!(state.expunge_uid(13));
        assert_eq!(state.uids(), vec![10, 12]);
    }

    #[test]
    fn test_set_flags_at_appends_new_uid() {
        let state = FlagUidState::new();
        state.set_flags_at(1, 100, MessageFlags::SEEN);
        state.set_flags_at(2, 101, MessageFlags::empty());
        state.set_flags_at(1, 100, MessageFlags::ANSWERED);
        assert_eq!(state.len(), 2);
        assert_eq!(state.get_flags(100), (MessageFlags::ANSWERED, true));
    }

    #[test]
    fn test_custom_flags() {
        let state = FlagUidState::new();
        state.add_custom_flags(3, "$Label1 $Todo");
        state.add_custom_flags(3, "$todo NonJunk");
        assert_eq!(state.get_custom_flags(3).as_deref(), Some("$Label1 $Todo NonJunk"));
        state.clear_custom_flags(3, "$LABEL1");
        assert_eq!(state.get_custom_flags(3).as_deref(), Some("$Todo NonJunk"));
        state.clear_custom_flags(3, "");
        assert!(state.get_custom_flags(3).is_none());
    }

    #[test]
    fn test_uid_validity_change_resets() {
        let state = FlagUidState::new();
        assert!(!state.set_uid_validity(7));
        state.set_flags(1, MessageFlags::SEEN);
        assert!(!state.set_uid_validity(7));
        assert_eq!(state.len(), 1);
        assert!(state.set_uid_validity(8));
        assert!(state.is_empty());
        assert_eq!(state.uid_validity(), Some(8));
    }

    #[test]
    fn test_permanent_flags() {
        let state = FlagUidState::new();
        state.set_permanent_flags(["\\Seen", "\\Deleted", "\\*"]);
        let supported = state.supported_user_flags();
        assert!(supported.contains(MessageFlags::SEEN | MessageFlags::DELETED));
        assert!(supported.contains(MessageFlags::KEYWORDS));
        state.set_permanent_flags(["\\Seen"]);
        assert!(!state.supported_user_flags().contains(MessageFlags::KEYWORDS));
        state.reset();
        assert!(state.supported_user_flags().contains(MessageFlags::SEEN));
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;
        let state = Arc::new(FlagUidState::new());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        state.set_flags(t * 100 + i, MessageFlags::SEEN);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.len(), 200);
    }
}
