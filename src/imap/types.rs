// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::imap::namespace::NamespaceType;

bitflags! {
    /// Per-message flag bits as tracked by [`FlagUidState`](crate::imap::flag_state::FlagUidState).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u16 {
        const SEEN = 0x0001;
        const ANSWERED = 0x0002;
        const FLAGGED = 0x0004;
        const DELETED = 0x0008;
        const DRAFT = 0x0010;
        const RECENT = 0x0020;
        const FORWARDED = 0x0040;
        const MDN_SENT = 0x0080;
        /// The message carries at least one keyword outside the known set.
        const KEYWORDS = 0x0100;
    }
}

impl MessageFlags {
    /// Splits a server flag list into known bits and free-form keywords.
    pub fn from_server_names<'a, I>(names: I) -> (MessageFlags, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut flags = MessageFlags::empty();
        let mut keywords = Vec::new();
        for name in names {
            match name.to_ascii_lowercase().as_str() {
                "\\seen" => flags.insert(MessageFlags::SEEN),
                "\\answered" => flags.insert(MessageFlags::ANSWERED),
                "\\flagged" => flags.insert(MessageFlags::FLAGGED),
                "\\deleted" => flags.insert(MessageFlags::DELETED),
                "\\draft" => flags.insert(MessageFlags::DRAFT),
                "\\recent" => flags.insert(MessageFlags::RECENT),
                "$forwarded" => flags.insert(MessageFlags::FORWARDED),
                "$mdnsent" => flags.insert(MessageFlags::MDN_SENT),
                "" => {}
                _ => keywords.push(name.to_string()),
            }
        }
        if !keywords.is_empty() {
            flags.insert(MessageFlags::KEYWORDS);
        }
        (flags, keywords)
    }

    /// Server spelling of every storable bit that is set. `\Recent` and the
    /// keyword marker are never sent.
    pub fn server_names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(MessageFlags::SEEN) {
            names.push("\\Seen");
        }
        if self.contains(MessageFlags::ANSWERED) {
            names.push("\\Answered");
        }
        if self.contains(MessageFlags::FLAGGED) {
            names.push("\\Flagged");
        }
        if self.contains(MessageFlags::DELETED) {
            names.push("\\Deleted");
        }
        if self.contains(MessageFlags::DRAFT) {
            names.push("\\Draft");
        }
        if self.contains(MessageFlags::FORWARDED) {
            names.push("$Forwarded");
        }
        if self.contains(MessageFlags::MDN_SENT) {
            names.push("$MDNSent");
        }
        names
    }
}

bitflags! {
    /// Mailbox attributes from LIST/LSUB plus the markers this crate derives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MailboxFlags: u32 {
        const NOSELECT = 0x0001;
        const NOINFERIORS = 0x0002;
        const MARKED = 0x0004;
        const UNMARKED = 0x0008;
        const HAS_CHILDREN = 0x0010;
        const HAS_NO_CHILDREN = 0x0020;
        const NONEXISTENT = 0x0040;
        const SUBSCRIBED = 0x0080;
        const TRASH = 0x0100;
        const SENT = 0x0200;
        const DRAFTS = 0x0400;
        const JUNK = 0x0800;
        const ARCHIVE = 0x1000;
        const ALL_MAIL = 0x2000;
        const INBOX = 0x4000;
        /// The mailbox is a namespace prefix rather than a real folder.
        const NAMESPACE = 0x8000;
        const PERSONAL = 0x1_0000;
        const PUBLIC = 0x2_0000;
        const OTHER_USERS = 0x4_0000;
    }
}

impl MailboxFlags {
    pub fn from_attribute(attr: &str) -> MailboxFlags {
        match attr.to_ascii_lowercase().as_str() {
            "\\noselect" => MailboxFlags::NOSELECT,
            "\\noinferiors" => MailboxFlags::NOINFERIORS,
            "\\marked" => MailboxFlags::MARKED,
            "\\unmarked" => MailboxFlags::UNMARKED,
            "\\haschildren" => MailboxFlags::HAS_CHILDREN,
            "\\hasnochildren" => MailboxFlags::HAS_NO_CHILDREN,
            "\\nonexistent" => MailboxFlags::NONEXISTENT | MailboxFlags::NOSELECT,
            "\\subscribed" => MailboxFlags::SUBSCRIBED,
            "\\trash" => MailboxFlags::TRASH,
            "\\sent" => MailboxFlags::SENT,
            "\\drafts" => MailboxFlags::DRAFTS,
            "\\junk" | "\\spam" => MailboxFlags::JUNK,
            "\\archive" => MailboxFlags::ARCHIVE,
            "\\all" | "\\allmail" => MailboxFlags::ALL_MAIL,
            "\\inbox" => MailboxFlags::INBOX,
            _ => MailboxFlags::empty(),
        }
    }

    pub fn for_namespace_type(ns_type: NamespaceType) -> MailboxFlags {
        match ns_type {
            NamespaceType::Personal => MailboxFlags::PERSONAL,
            NamespaceType::Public => MailboxFlags::PUBLIC,
            NamespaceType::OtherUsers => MailboxFlags::OTHER_USERS,
        }
    }
}

bitflags! {
    /// Capability bits negotiated with a server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u64 {
        const IMAP4REV1 = 1 << 0;
        const STARTTLS = 1 << 1;
        const LOGIN_DISABLED = 1 << 2;
        const AUTH_PLAIN = 1 << 3;
        const AUTH_LOGIN = 1 << 4;
        const AUTH_CRAM_MD5 = 1 << 5;
        const AUTH_GSSAPI = 1 << 6;
        const AUTH_NTLM = 1 << 7;
        const AUTH_MSN = 1 << 8;
        const AUTH_XOAUTH2 = 1 << 9;
        const SASL_IR = 1 << 10;
        const NAMESPACE = 1 << 11;
        const IDLE = 1 << 12;
        const UIDPLUS = 1 << 13;
        const MOVE = 1 << 14;
        const ACL = 1 << 15;
        const QUOTA = 1 << 16;
        const ID = 1 << 17;
        const XLIST = 1 << 18;
        const SPECIAL_USE = 1 << 19;
        const LITERAL_PLUS = 1 << 20;
        const CONDSTORE = 1 << 21;
        const ENABLE = 1 << 22;
        const UNSELECT = 1 << 23;
        const CHILDREN = 1 << 24;
        const LIST_EXTENDED = 1 << 25;
        const COMPRESS_DEFLATE = 1 << 26;
    }
}

impl Capabilities {
    /// Builds the bit set from capability atoms; unknown atoms are ignored.
    pub fn from_tokens<'a, I>(tokens: I) -> Capabilities
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut caps = Capabilities::empty();
        for token in tokens {
            let bit = match token.to_ascii_uppercase().as_str() {
                "IMAP4REV1" | "IMAP4REV2" => Capabilities::IMAP4REV1,
                "STARTTLS" => Capabilities::STARTTLS,
                "LOGINDISABLED" => Capabilities::LOGIN_DISABLED,
                "AUTH=PLAIN" => Capabilities::AUTH_PLAIN,
                "AUTH=LOGIN" => Capabilities::AUTH_LOGIN,
                "AUTH=CRAM-MD5" => Capabilities::AUTH_CRAM_MD5,
                "AUTH=GSSAPI" => Capabilities::AUTH_GSSAPI,
                "AUTH=NTLM" => Capabilities::AUTH_NTLM,
                "AUTH=MSN" => Capabilities::AUTH_MSN,
                "AUTH=XOAUTH2" => Capabilities::AUTH_XOAUTH2,
                "SASL-IR" => Capabilities::SASL_IR,
                "NAMESPACE" => Capabilities::NAMESPACE,
                "IDLE" => Capabilities::IDLE,
                "UIDPLUS" => Capabilities::UIDPLUS,
                "MOVE" => Capabilities::MOVE,
                "ACL" => Capabilities::ACL,
                "QUOTA" => Capabilities::QUOTA,
                "ID" => Capabilities::ID,
                "XLIST" => Capabilities::XLIST,
                "SPECIAL-USE" => Capabilities::SPECIAL_USE,
                "LITERAL+" => Capabilities::LITERAL_PLUS,
                "CONDSTORE" => Capabilities::CONDSTORE,
                "ENABLE" => Capabilities::ENABLE,
                "UNSELECT" => Capabilities::UNSELECT,
                "CHILDREN" => Capabilities::CHILDREN,
                "LIST-EXTENDED" => Capabilities::LIST_EXTENDED,
                "COMPRESS=DEFLATE" => Capabilities::COMPRESS_DEFLATE,
                _ => Capabilities::empty(),
            };
            caps.insert(bit);
        }
        caps
    }
}

/// A mailbox reported by LIST/LSUB, resolved against the namespace table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxSpec {
    /// Name exactly as the server spells it.
    pub server_path: String,
    /// '/'-delimited path used everywhere off the wire.
    pub canonical_path: String,
    pub delimiter: Option<char>,
    pub flags: MailboxFlags,
    pub namespace_type: Option<NamespaceType>,
    /// Owning user for mailboxes in an other-users namespace.
    pub owner: Option<String>,
}

/// How a STORE changes the flags of the addressed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOperation {
    Add,
    Remove,
    Replace,
}

impl StoreOperation {
    pub fn as_item(self) -> &'static str {
        match self {
            StoreOperation::Add => "+FLAGS",
            StoreOperation::Remove => "-FLAGS",
            StoreOperation::Replace => "FLAGS",
        }
    }
}

/// Formats UIDs as a compact IMAP sequence set, collapsing consecutive runs.
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted: Vec<u32> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if next == end + 1 {
                end = next;
                iter.next();
            } else {
                break;
            }
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }
    parts.join(",")
}

/// Quotes a string for use as an IMAP astring argument.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
