// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP namespaces (RFC 2342) and folder path translation.
//!
//! Everything off the wire uses canonical paths with `/` as the hierarchy
//! delimiter. A literal `/` inside a server mailbox name is kept canonically as
//! `%2F`, and a literal `%` as `%25`, so any server name survives the trip to
//! its canonical form and back.

use log::debug;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case};
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::multi::{many0, many1, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;
use serde::{Deserialize, Serialize};

use crate::imap::error::ImapError;
use crate::imap::response::{nstring, string};

pub const CANONICAL_DELIMITER: char = '/';
const ESCAPED_SLASH: &str = "%2F";
const ESCAPED_PERCENT: &str = "%25";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceType {
    Personal,
    Public,
    OtherUsers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub ns_type: NamespaceType,
    /// Prefix as the server spells it, usually ending in the delimiter.
    pub prefix: String,
    pub delimiter: char,
    pub from_config: bool,
    /// False until a LIST response showed the real delimiter.
    pub delimiter_confirmed: bool,
}

impl Namespace {
    pub fn new(ns_type: NamespaceType, prefix: &str, delimiter: char, from_config: bool) -> Self {
        Self {
            ns_type,
            prefix: prefix.to_string(),
            delimiter,
            from_config,
            delimiter_confirmed: !from_config,
        }
    }

    fn same_entry(&self, other: &Namespace) -> bool {
        self.ns_type == other.ns_type
            && self.prefix == other.prefix
            && self.delimiter == other.delimiter
    }

    /// Prefix without its trailing delimiter, e.g. `#shared` for `#shared/`.
    pub fn trimmed_prefix(&self) -> &str {
        self.prefix
            .strip_suffix(self.delimiter)
            .unwrap_or(&self.prefix)
    }

    /// Prefix translated to the canonical delimiter.
    pub fn canonical_prefix(&self) -> String {
        to_canonical_path(&self.prefix, self.delimiter)
    }

    pub fn to_server_path(&self, canonical: &str) -> String {
        to_server_path(canonical, self.delimiter)
    }

    pub fn to_canonical_path(&self, server: &str) -> String {
        to_canonical_path(server, self.delimiter)
    }
}

/// Converts a canonical path to the server's spelling for `delimiter`.
pub fn to_server_path(canonical: &str, delimiter: char) -> String {
    if delimiter == CANONICAL_DELIMITER {
        return canonical.to_string();
    }
    let mut out = String::with_capacity(canonical.len());
    let mut rest = canonical;
    while let Some(c) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix(ESCAPED_SLASH) {
            out.push('/');
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix(ESCAPED_PERCENT) {
            out.push('%');
            rest = after;
            continue;
        }
        out.push(if c == CANONICAL_DELIMITER { delimiter } else { c });
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Converts a server mailbox name to its canonical path for `delimiter`.
pub fn to_canonical_path(server: &str, delimiter: char) -> String {
    if delimiter == CANONICAL_DELIMITER {
        return server.to_string();
    }
    let mut out = String::with_capacity(server.len());
    for c in server.chars() {
        if c == '/' {
            out.push_str(ESCAPED_SLASH);
        } else if c == '%' {
            out.push_str(ESCAPED_PERCENT);
        } else if c == delimiter {
            out.push(CANONICAL_DELIMITER);
        } else {
            out.push(c);
        }
    }
    out
}

/// Ordered namespace entries for one host. Counts are always small, so lookups
/// are linear scans.
#[derive(Debug, Clone, Default)]
pub struct NamespaceTable {
    entries: Vec<Namespace>,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.entries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Namespace> {
        self.entries.get(index)
    }

    pub fn has_server_advertised(&self) -> bool {
        self.entries.iter().any(|ns| !ns.from_config)
    }

    /// Adds an entry, returning whether the table changed.
    ///
    /// A server-advertised entry takes the slot of a config entry with the same
    /// (prefix, type, delimiter); after that every other config entry is
    /// dropped. Config entries are ignored once the server has spoken.
    pub fn add_namespace(&mut self, ns: Namespace) -> bool {
        if ns.from_config {
            if self.has_server_advertised() || self.entries.iter().any(|e| e.same_entry(&ns)) {
                return false;
            }
            self.entries.push(ns);
            return true;
        }

        if self
            .entries
            .iter()
            .any(|e| !e.from_config && e.same_entry(&ns))
        {
            return false;
        }
        match self
            .entries
            .iter()
            .position(|e| e.from_config && e.same_entry(&ns))
        {
            Some(pos) => self.entries[pos] = ns,
            None => self.entries.push(ns),
        }
        let before = self.entries.len();
        self.entries.retain(|e| !e.from_config);
        if before != self.entries.len() {
            debug!("Evicted {} config namespaces", before - self.entries.len());
        }
        true
    }

    /// Longest-prefix match for a canonical folder path.
    pub fn match_folder(&self, canonical: &str) -> Option<&Namespace> {
        if canonical.eq_ignore_ascii_case("INBOX") {
            return self.default_of_type(NamespaceType::Personal);
        }
        self.longest_match(canonical, |ns| ns.canonical_prefix())
    }

    /// Longest-prefix match for a mailbox name as the server spells it.
    pub fn match_server_folder(&self, server_name: &str) -> Option<&Namespace> {
        if server_name.eq_ignore_ascii_case("INBOX") {
            return self.default_of_type(NamespaceType::Personal);
        }
        self.longest_match(server_name, |ns| ns.prefix.clone())
    }

    fn longest_match<F>(&self, name: &str, prefix_of: F) -> Option<&Namespace>
    where
        F: Fn(&Namespace) -> String,
    {
        let mut best: Option<(&Namespace, usize)> = None;
        for ns in &self.entries {
            let prefix = prefix_of(ns);
            let matched =
                name.starts_with(&prefix) || (!name.is_empty() && prefix.starts_with(name));
            if !matched {
                continue;
            }
            if best.map_or(true, |(_, len)| prefix.len() > len) {
                best = Some((ns, prefix.len()));
            }
        }
        best.map(|(ns, _)| ns)
    }

    /// Entry with an empty prefix if any, else the first of that type.
    pub fn default_of_type(&self, ns_type: NamespaceType) -> Option<&Namespace> {
        let mut of_type = self.entries.iter().filter(|ns| ns.ns_type == ns_type);
        let first = of_type.next()?;
        if first.prefix.is_empty() {
            return Some(first);
        }
        of_type.find(|ns| ns.prefix.is_empty()).or(Some(first))
    }

    /// Records the delimiter seen in a LIST response for the namespace
    /// holding `server_name`. Returns true if an unconfirmed entry changed.
    pub fn confirm_delimiter(&mut self, server_name: &str, delimiter: char) -> bool {
        let mut best: Option<(usize, usize)> = None;
        for (index, ns) in self.entries.iter().enumerate() {
            if ns.delimiter_confirmed || !server_name.starts_with(ns.trimmed_prefix()) {
                continue;
            }
            let len = ns.trimmed_prefix().len();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((index, len));
            }
        }
        let Some((index, _)) = best else {
            return false;
        };
        let ns = &mut self.entries[index];
        if ns.delimiter != delimiter && ns.prefix.ends_with(ns.delimiter) {
            ns.prefix.pop();
            ns.prefix.push(delimiter);
        }
        ns.delimiter = delimiter;
        ns.delimiter_confirmed = true;
        true
    }

    /// The namespace whose prefix (minus delimiter) is exactly `server_name`.
    pub fn folder_is_namespace(&self, server_name: &str) -> Option<&Namespace> {
        self.entries
            .iter()
            .find(|ns| !ns.prefix.is_empty() && ns.trimmed_prefix() == server_name)
    }

    /// User owning a mailbox in an other-users namespace.
    pub fn owner_of(&self, server_name: &str) -> Option<String> {
        let ns = self.match_server_folder(server_name)?;
        if ns.ns_type != NamespaceType::OtherUsers {
            return None;
        }
        let rest = server_name.strip_prefix(ns.prefix.as_str())?;
        rest.split(ns.delimiter)
            .next()
            .filter(|owner| !owner.is_empty())
            .map(str::to_string)
    }

    pub fn clear_config_sourced(&mut self) {
        self.entries.retain(|ns| !ns.from_config);
    }

    pub fn clear_server_advertised(&mut self) {
        self.entries.retain(|ns| ns.from_config);
    }
}

/// Builds config-sourced entries from a list such as `"INBOX.","#shared/"`.
/// The delimiter is guessed from the prefix and stays unconfirmed.
pub fn from_config_prefixes(ns_type: NamespaceType, list: &str) -> Vec<Namespace> {
    list.split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| raw.trim_matches('"'))
        .map(|prefix| {
            let delimiter = prefix
                .chars()
                .last()
                .filter(|c| c.is_ascii_punctuation())
                .unwrap_or(CANONICAL_DELIMITER);
            Namespace::new(ns_type, prefix, delimiter, true)
        })
        .collect()
}

/// One `("prefix" "delim" ...)` entry; extension data is read and dropped.
fn namespace_desc(i: &[u8]) -> IResult<&[u8], (Vec<u8>, Option<Vec<u8>>)> {
    let extension = tuple((
        char(' '),
        string,
        tag(" ("),
        separated_list1(char(' '), string),
        char(')'),
    ));
    delimited(
        char('('),
        terminated(pair(string, preceded(char(' '), nstring)), many0(extension)),
        char(')'),
    )(i)
}

fn namespace_group(i: &[u8]) -> IResult<&[u8], Vec<(Vec<u8>, Option<Vec<u8>>)>> {
    alt((
        map(tag_no_case("NIL"), |_| Vec::new()),
        delimited(
            char('('),
            many1(preceded(opt(char(' ')), namespace_desc)),
            char(')'),
        ),
    ))(i)
}

/// Parses the data of an untagged NAMESPACE response, e.g.
/// `(("" "/")) NIL (("#shared/" "/"))`. Groups come in personal, other
/// users, shared order; a NIL delimiter falls back to `/`.
pub fn parse_namespace_response(data: &[u8]) -> Result<Vec<Namespace>, ImapError> {
    let mut groups = tuple((
        namespace_group,
        preceded(char(' '), namespace_group),
        preceded(char(' '), namespace_group),
        opt(tag("\r\n")),
    ));
    let (personal, other_users, public) = match groups(data) {
        Ok((rest, (personal, other_users, public, _))) if rest.is_empty() => {
            (personal, other_users, public)
        }
        _ => {
            return Err(ImapError::Parse(format!(
                "malformed NAMESPACE response: {:?}",
                String::from_utf8_lossy(data).trim_end()
            )))
        }
    };

    let mut namespaces = Vec::new();
    for (ns_type, group) in [
        (NamespaceType::Personal, personal),
        (NamespaceType::OtherUsers, other_users),
        (NamespaceType::Public, public),
    ] {
        for (prefix, delimiter) in group {
            let prefix = String::from_utf8_lossy(&prefix);
            let delimiter = delimiter
                .and_then(|d| d.first().copied())
                .map(char::from)
                .unwrap_or(CANONICAL_DELIMITER);
            namespaces.push(Namespace::new(ns_type, &prefix, delimiter, false));
        }
    }
    Ok(namespaces)
}
