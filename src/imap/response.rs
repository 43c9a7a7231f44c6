// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Server response reading and parsing.
//!
//! [`ResponseReader`] frames the byte stream into logical responses: a line
//! plus any `{n}` literals it announced, kept exactly as they appear on the
//! wire. It keeps partial input across calls, so a read timeout in the middle
//! of a line or literal loses nothing.
//!
//! [`parse_response`] hands each framed response to `imap_proto` and maps the
//! result onto the types below. NAMESPACE, ESEARCH and ENABLED are outside
//! what `imap_proto` understands and are parsed with small `nom` grammars.

use std::borrow::Cow;
use std::io::{self, BufRead};

use imap_proto::types::{
    AttributeValue, Capability, MailboxDatum, MessageSection, NameAttribute, QuotaResourceName,
    Response as WireResponse, ResponseCode as WireCode, SectionPath, Status as WireStatus,
    StatusAttribute,
};
use log::trace;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt};
use nom::error::{Error as NomError, ErrorKind};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::imap::error::ImapError;
use crate::imap::namespace::{parse_namespace_response, Namespace};

/// Literals above this size are treated as a protocol violation.
pub const MAX_LITERAL_SIZE: usize = 256 * 1024 * 1024;

/// Longest line accepted between literals, CRLF included.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Most UIDs a single ESEARCH response may expand to.
pub const MAX_SEARCH_RESULTS: u64 = 1_000_000;

/// One logical server response before parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    /// Wire bytes: every line ends in CRLF and literal payloads follow their
    /// `{n}` markers.
    pub bytes: Vec<u8>,
}

impl RawResponse {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// First line without its CRLF. Literal payloads are never included.
    pub fn first_line(&self) -> Cow<'_, str> {
        let end = self
            .bytes
            .windows(2)
            .position(|pair| pair == b"\r\n")
            .unwrap_or(self.bytes.len());
        String::from_utf8_lossy(&self.bytes[..end])
    }
}

#[derive(Debug, Default)]
pub struct ResponseReader {
    bytes: Vec<u8>,
    line: Vec<u8>,
    literal_remaining: Option<usize>,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when part of a response has been read but not yet returned.
    pub fn has_partial(&self) -> bool {
        !self.bytes.is_empty() || !self.line.is_empty() || self.literal_remaining.is_some()
    }

    /// Reads the next complete response. Timeouts (`WouldBlock`/`TimedOut`)
    /// are returned as-is with partial state kept for the next call.
    pub fn read_response<R: BufRead>(&mut self, reader: &mut R) -> io::Result<RawResponse> {
        loop {
            if let Some(remaining) = self.literal_remaining {
                if remaining > 0 {
                    let buf = reader.fill_buf()?;
                    if buf.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside literal",
                        ));
                    }
                    let take = buf.len().min(remaining);
                    self.bytes.extend_from_slice(&buf[..take]);
                    reader.consume(take);
                    self.literal_remaining = Some(remaining - take);
                    continue;
                }
                self.literal_remaining = None;
            }

            self.read_line(reader)?;
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let literal = literal_size(&self.line);
            self.bytes.extend_from_slice(&self.line);
            self.bytes.extend_from_slice(b"\r\n");
            self.line.clear();

            match literal {
                Some(size) if size > MAX_LITERAL_SIZE => {
                    self.reset();
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("literal of {} bytes exceeds limit", size),
                    ));
                }
                Some(size) => self.literal_remaining = Some(size),
                None => return Ok(RawResponse::new(std::mem::take(&mut self.bytes))),
            }
        }
    }

    /// Appends input to `self.line` up to and including the next LF.
    fn read_line<R: BufRead>(&mut self, reader: &mut R) -> io::Result<()> {
        loop {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ));
            }
            let (used, complete) = match buf.iter().position(|&b| b == b'\n') {
                Some(end) => (end + 1, true),
                None => (buf.len(), false),
            };
            if self.line.len() + used > MAX_LINE_LENGTH {
                self.reset();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response line exceeds {} bytes", MAX_LINE_LENGTH),
                ));
            }
            self.line.extend_from_slice(&buf[..used]);
            reader.consume(used);
            if complete {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.bytes.clear();
        self.line.clear();
        self.literal_remaining = None;
    }
}

/// Size announced by a trailing `{n}` or `{n+}` marker.
pub fn literal_size(line: &[u8]) -> Option<usize> {
    let body = line.strip_suffix(b"}")?;
    let open = body.iter().rposition(|&b| b == b'{')?;
    let digits = &body[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
}

impl From<WireStatus> for Status {
    fn from(status: WireStatus) -> Self {
        match status {
            WireStatus::Ok => Status::Ok,
            WireStatus::No => Status::No,
            WireStatus::PreAuth => Status::PreAuth,
            WireStatus::Bye => Status::Bye,
            _ => Status::Bad,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    Capability(Vec<String>),
    PermanentFlags(Vec<String>),
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    Other(String, Option<String>),
}

impl ResponseCode {
    pub fn name(&self) -> String {
        match self {
            ResponseCode::Alert => "ALERT".into(),
            ResponseCode::Capability(_) => "CAPABILITY".into(),
            ResponseCode::PermanentFlags(_) => "PERMANENTFLAGS".into(),
            ResponseCode::ReadOnly => "READ-ONLY".into(),
            ResponseCode::ReadWrite => "READ-WRITE".into(),
            ResponseCode::TryCreate => "TRYCREATE".into(),
            ResponseCode::UidNext(_) => "UIDNEXT".into(),
            ResponseCode::UidValidity(_) => "UIDVALIDITY".into(),
            ResponseCode::Unseen(_) => "UNSEEN".into(),
            ResponseCode::Other(name, _) => name.to_ascii_uppercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: Status,
    pub code: Option<ResponseCode>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    List,
    Lsub,
    Xlist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodySection {
    /// Section path such as `HEADER`, `1.2.MIME` or empty for the whole message.
    pub section: String,
    pub origin: Option<u32>,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchData {
    pub uid: Option<u32>,
    pub flags: Option<Vec<String>>,
    pub size: Option<u32>,
    pub internal_date: Option<String>,
    pub modseq: Option<u64>,
    pub sections: Vec<BodySection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Untagged {
    Status(StatusResponse),
    Capability(Vec<String>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch {
        seq: u32,
        data: FetchData,
    },
    Flags(Vec<String>),
    List {
        kind: ListKind,
        attributes: Vec<String>,
        delimiter: Option<char>,
        name: String,
    },
    Namespace(Vec<Namespace>),
    Search(Vec<u32>),
    MailboxStatus {
        mailbox: String,
        items: Vec<(String, u64)>,
    },
    MyRights {
        mailbox: String,
        rights: String,
    },
    Quota {
        root: String,
        resources: Vec<(String, u64, u64)>,
    },
    Enabled(Vec<String>),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Tagged {
        tag: String,
        status: StatusResponse,
    },
    Untagged(Untagged),
    Continuation(String),
}

/// Parses one framed response.
pub fn parse_response(raw: RawResponse) -> Result<Response, ImapError> {
    let line = raw.first_line();
    if let Some(rest) = line.strip_prefix('+') {
        return Ok(Response::Continuation(rest.trim().to_string()));
    }

    let bytes = raw.bytes.as_slice();
    let verb = untagged_verb(bytes);
    let kind = match verb.as_deref() {
        Some("NAMESPACE") => {
            let data = &bytes["* NAMESPACE".len()..];
            let namespaces = parse_namespace_response(data.strip_prefix(b" ").unwrap_or(data))?;
            return Ok(Response::Untagged(Untagged::Namespace(namespaces)));
        }
        Some("ESEARCH") => {
            let ranges = finish(esearch(bytes), &line)?;
            return Ok(Response::Untagged(Untagged::Search(expand_ranges(&ranges, &line)?)));
        }
        Some("ENABLED") => {
            let enabled = finish(enabled(bytes), &line)?;
            return Ok(Response::Untagged(Untagged::Enabled(enabled)));
        }
        Some("LSUB") => ListKind::Lsub,
        Some("XLIST") => ListKind::Xlist,
        _ => ListKind::List,
    };

    // XLIST shares the LIST grammar.
    let wire: Cow<'_, [u8]> = match kind {
        ListKind::Xlist => Cow::Owned([&b"* LIST"[..], &bytes["* XLIST".len()..]].concat()),
        _ => Cow::Borrowed(bytes),
    };
    match imap_proto::parser::parse_response(&wire) {
        Ok((_, response)) => from_wire(response, kind, &line),
        Err(nom::Err::Incomplete(_)) => {
            Err(ImapError::Parse(format!("truncated response: {:?}", line)))
        }
        Err(_) if bytes.starts_with(b"* ") => {
            trace!("unrecognized untagged response: {}", line);
            Ok(Response::Untagged(Untagged::Other(line.into_owned())))
        }
        Err(_) => Err(ImapError::Parse(format!("malformed response: {:?}", line))),
    }
}

/// Upper-cased keyword of an untagged response, e.g. `LIST` for `* LIST ...`.
fn untagged_verb(bytes: &[u8]) -> Option<String> {
    let rest = bytes.strip_prefix(b"* ")?;
    let end = rest
        .iter()
        .position(|&b| b == b' ' || b == b'\r')
        .unwrap_or(rest.len());
    Some(String::from_utf8_lossy(&rest[..end]).to_ascii_uppercase())
}

fn from_wire(response: WireResponse<'_>, kind: ListKind, line: &str) -> Result<Response, ImapError> {
    let untagged = match response {
        WireResponse::Done {
            tag,
            status,
            code,
            information,
        } => {
            let status = status_response(status, code, information.as_deref(), line);
            if !matches!(status.status, Status::Ok | Status::No | Status::Bad) {
                return Err(ImapError::Parse(format!("unexpected tagged status in {:?}", line)));
            }
            return Ok(Response::Tagged { tag: tag.0, status });
        }
        WireResponse::Continue { information, .. } => {
            return Ok(Response::Continuation(
                information.as_deref().unwrap_or_default().trim().to_string(),
            ));
        }
        WireResponse::Data {
            status,
            code,
            information,
        } => Untagged::Status(status_response(status, code, information.as_deref(), line)),
        WireResponse::Capabilities(capabilities) => {
            Untagged::Capability(capabilities.iter().map(capability_token).collect())
        }
        WireResponse::Expunge(seq) => Untagged::Expunge(seq),
        WireResponse::Fetch(seq, attributes) => Untagged::Fetch {
            seq,
            data: fetch_data(attributes),
        },
        WireResponse::MailboxData(datum) => mailbox_data(datum, kind, line),
        WireResponse::Quota(quota) => Untagged::Quota {
            root: quota.root_name.to_string(),
            resources: quota
                .resources
                .iter()
                .map(|resource| {
                    (
                        quota_resource_name(&resource.name),
                        resource.usage,
                        resource.limit,
                    )
                })
                .collect(),
        },
        WireResponse::MyRights(rights) => Untagged::MyRights {
            mailbox: rights.mailbox.to_string(),
            rights: rights.rights.iter().cloned().map(char::from).collect(),
        },
        _ => Untagged::Other(line.to_string()),
    };
    Ok(Response::Untagged(untagged))
}

fn status_response(
    status: WireStatus,
    code: Option<WireCode<'_>>,
    information: Option<&str>,
    line: &str,
) -> StatusResponse {
    let text = information.unwrap_or_default().trim();
    let (code, text) = match code {
        Some(code) => (response_code(code, line), text),
        // Codes imap_proto does not know stay at the front of the text.
        None => match bracketed_code(text) {
            Some((code, rest)) => (Some(code), rest),
            None => (None, text),
        },
    };
    StatusResponse {
        status: status.into(),
        code,
        text: text.to_string(),
    }
}

fn response_code(code: WireCode<'_>, line: &str) -> Option<ResponseCode> {
    let code = match code {
        WireCode::Alert => ResponseCode::Alert,
        WireCode::Capabilities(capabilities) => {
            ResponseCode::Capability(capabilities.iter().map(capability_token).collect())
        }
        WireCode::PermanentFlags(flags) => ResponseCode::PermanentFlags(strings(&flags)),
        WireCode::ReadOnly => ResponseCode::ReadOnly,
        WireCode::ReadWrite => ResponseCode::ReadWrite,
        WireCode::TryCreate => ResponseCode::TryCreate,
        WireCode::UidNext(next) => ResponseCode::UidNext(next),
        WireCode::UidValidity(validity) => ResponseCode::UidValidity(validity),
        WireCode::Unseen(seq) => ResponseCode::Unseen(seq),
        _ => {
            let open = line.find('[')?;
            return bracketed_code(&line[open..]).map(|(code, _)| code);
        }
    };
    Some(code)
}

/// Splits a leading `[NAME args]` off status text.
fn bracketed_code(text: &str) -> Option<(ResponseCode, &str)> {
    let inner = text.strip_prefix('[')?;
    let end = inner.find(']')?;
    let (name, args) = match inner[..end].split_once(' ') {
        Some((name, args)) => (name, Some(args.trim().to_string())),
        None => (&inner[..end], None),
    };
    Some((ResponseCode::Other(name.to_string(), args), inner[end + 1..].trim()))
}

fn capability_token(capability: &Capability<'_>) -> String {
    match capability {
        Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        Capability::Auth(mechanism) => format!("AUTH={}", mechanism),
        Capability::Atom(atom) => atom.to_string(),
        other => format!("{:?}", other),
    }
}

fn strings<S: ToString>(items: &[S]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn mailbox_data(datum: MailboxDatum<'_>, kind: ListKind, line: &str) -> Untagged {
    match datum {
        MailboxDatum::Exists(count) => Untagged::Exists(count),
        MailboxDatum::Recent(count) => Untagged::Recent(count),
        MailboxDatum::Flags(flags) => Untagged::Flags(strings(&flags)),
        MailboxDatum::List {
            name_attributes,
            delimiter,
            name,
        } => Untagged::List {
            kind,
            attributes: name_attributes.iter().map(name_attribute).collect(),
            delimiter: delimiter.as_ref().and_then(|d| d.chars().next()),
            name: name.to_string(),
        },
        MailboxDatum::Search(uids) => Untagged::Search(uids.to_vec()),
        MailboxDatum::Status { mailbox, status } => Untagged::MailboxStatus {
            mailbox: mailbox.to_string(),
            items: status.iter().filter_map(status_item).collect(),
        },
        _ => Untagged::Other(line.to_string()),
    }
}

fn name_attribute(attribute: &NameAttribute<'_>) -> String {
    let name = match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors",
        NameAttribute::NoSelect => "\\Noselect",
        NameAttribute::Marked => "\\Marked",
        NameAttribute::Unmarked => "\\Unmarked",
        NameAttribute::All => "\\All",
        NameAttribute::Archive => "\\Archive",
        NameAttribute::Drafts => "\\Drafts",
        NameAttribute::Flagged => "\\Flagged",
        NameAttribute::Junk => "\\Junk",
        NameAttribute::Sent => "\\Sent",
        NameAttribute::Trash => "\\Trash",
        NameAttribute::Extension(name) => return name.to_string(),
        other => return format!("\\{:?}", other),
    };
    name.to_string()
}

fn status_item(attribute: &StatusAttribute) -> Option<(String, u64)> {
    let (name, value) = match attribute {
        StatusAttribute::Messages(n) => ("MESSAGES", u64::from(*n)),
        StatusAttribute::Recent(n) => ("RECENT", u64::from(*n)),
        StatusAttribute::UidNext(n) => ("UIDNEXT", u64::from(*n)),
        StatusAttribute::UidValidity(n) => ("UIDVALIDITY", u64::from(*n)),
        StatusAttribute::Unseen(n) => ("UNSEEN", u64::from(*n)),
        StatusAttribute::HighestModSeq(n) => ("HIGHESTMODSEQ", *n),
        _ => return None,
    };
    Some((name.to_string(), value))
}

fn quota_resource_name(name: &QuotaResourceName<'_>) -> String {
    match name {
        QuotaResourceName::Storage => "STORAGE".to_string(),
        QuotaResourceName::Message => "MESSAGE".to_string(),
        QuotaResourceName::Atom(atom) => atom.to_ascii_uppercase(),
        other => format!("{:?}", other).to_ascii_uppercase(),
    }
}

fn fetch_data(attributes: Vec<AttributeValue<'_>>) -> FetchData {
    let mut fetch = FetchData::default();
    for attribute in attributes {
        match attribute {
            AttributeValue::Uid(uid) => fetch.uid = Some(uid),
            AttributeValue::Flags(flags) => fetch.flags = Some(strings(&flags)),
            AttributeValue::Rfc822Size(size) => fetch.size = Some(size),
            AttributeValue::InternalDate(date) => fetch.internal_date = Some(date.to_string()),
            AttributeValue::ModSeq(modseq) => fetch.modseq = Some(modseq),
            AttributeValue::BodySection {
                section,
                index,
                data,
            } => fetch.sections.push(BodySection {
                section: section.as_ref().map(section_name).unwrap_or_default(),
                origin: index,
                data: data.as_deref().map(<[u8]>::to_vec),
            }),
            AttributeValue::Rfc822(data) => fetch.sections.push(whole(String::new(), data.as_deref())),
            AttributeValue::Rfc822Header(data) => {
                fetch.sections.push(whole("HEADER".to_string(), data.as_deref()))
            }
            AttributeValue::Rfc822Text(data) => {
                fetch.sections.push(whole("TEXT".to_string(), data.as_deref()))
            }
            _ => {}
        }
    }
    fetch
}

fn whole(section: String, data: Option<&[u8]>) -> BodySection {
    BodySection {
        section,
        origin: None,
        data: data.map(<[u8]>::to_vec),
    }
}

fn section_name(path: &SectionPath) -> String {
    fn text(section: &MessageSection) -> &'static str {
        match section {
            MessageSection::Header => "HEADER",
            MessageSection::Mime => "MIME",
            MessageSection::Text => "TEXT",
            _ => "",
        }
    }
    match path {
        SectionPath::Full(section) => text(section).to_string(),
        SectionPath::Part(parts, section) => {
            let mut name = parts
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(".");
            if let Some(section) = section {
                name.push('.');
                name.push_str(text(section));
            }
            name
        }
        _ => String::new(),
    }
}

/// Unwraps a grammar result that must consume the whole response.
fn finish<T>(result: IResult<&[u8], T>, line: &str) -> Result<T, ImapError> {
    match result {
        Ok((rest, value)) if rest.is_empty() => Ok(value),
        _ => Err(ImapError::Parse(format!("malformed response: {:?}", line))),
    }
}

fn reject(input: &[u8]) -> nom::Err<NomError<&[u8]>> {
    nom::Err::Error(NomError::new(input, ErrorKind::Char))
}

pub(crate) fn number<T: std::str::FromStr>(i: &[u8]) -> IResult<&[u8], T> {
    map_res(digit1, |digits: &[u8]| {
        std::str::from_utf8(digits)
            .map_err(|_| ())
            .and_then(|s| s.parse::<T>().map_err(|_| ()))
    })(i)
}

fn atom(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|c: u8| c.is_ascii_graphic() && !b"(){%*\"\\]".contains(&c))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (mut rest, _) = char('"')(i)?;
    let mut out = Vec::new();
    loop {
        match rest.split_first() {
            Some((&b'"', tail)) => return Ok((tail, out)),
            Some((&b'\\', tail)) => {
                let (&escaped, tail) = tail.split_first().ok_or_else(|| reject(i))?;
                out.push(escaped);
                rest = tail;
            }
            Some((&b'\r', _)) | Some((&b'\n', _)) | None => return Err(reject(i)),
            Some((&c, tail)) => {
                out.push(c);
                rest = tail;
            }
        }
    }
}

fn literal(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (i, size) = delimited(char('{'), number::<usize>, pair(opt(char('+')), tag("}\r\n")))(i)?;
    let (i, data) = take(size)(i)?;
    Ok((i, data.to_vec()))
}

/// A quoted string or a literal.
pub(crate) fn string(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((quoted, literal))(i)
}

/// A string, or `None` for `NIL`.
pub(crate) fn nstring(i: &[u8]) -> IResult<&[u8], Option<Vec<u8>>> {
    alt((map(tag_no_case("NIL"), |_| None), map(string, Some)))(i)
}

fn sequence_set(i: &[u8]) -> IResult<&[u8], Vec<(u32, u32)>> {
    separated_list1(
        char(','),
        map(
            pair(number::<u32>, opt(preceded(char(':'), number::<u32>))),
            |(start, end)| {
                let end = end.unwrap_or(start);
                (start.min(end), start.max(end))
            },
        ),
    )(i)
}

fn search_return(i: &[u8]) -> IResult<&[u8], Vec<(u32, u32)>> {
    alt((
        preceded(tag_no_case("ALL "), sequence_set),
        map(
            preceded(alt((tag_no_case("MIN "), tag_no_case("MAX "))), number::<u32>),
            |n| vec![(n, n)],
        ),
        map(
            preceded(alt((tag_no_case("COUNT "), tag_no_case("MODSEQ "))), number::<u64>),
            |_| Vec::new(),
        ),
    ))(i)
}

/// `* ESEARCH [(TAG "t")] [UID] *(SP name SP value)` (RFC 4731).
fn esearch(i: &[u8]) -> IResult<&[u8], Vec<(u32, u32)>> {
    let (i, _) = tag_no_case("* ESEARCH")(i)?;
    let (i, _) = opt(delimited(tag_no_case(" (TAG "), string, char(')')))(i)?;
    let (i, _) = opt(tag_no_case(" UID"))(i)?;
    let (i, data) = many0(preceded(char(' '), search_return))(i)?;
    let (i, _) = tag("\r\n")(i)?;
    Ok((i, data.concat()))
}

fn enabled(i: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(
        tag_no_case("* ENABLED"),
        many0(preceded(
            char(' '),
            map(atom, |a: &[u8]| String::from_utf8_lossy(a).into_owned()),
        )),
        tag("\r\n"),
    )(i)
}

fn expand_ranges(ranges: &[(u32, u32)], line: &str) -> Result<Vec<u32>, ImapError> {
    let total: u64 = ranges
        .iter()
        .map(|&(start, end)| u64::from(end - start) + 1)
        .sum();
    if total > MAX_SEARCH_RESULTS {
        return Err(ImapError::Parse(format!(
            "search result of {} UIDs exceeds limit: {:?}",
            total, line
        )));
    }
    let mut uids: Vec<u32> = ranges.iter().flat_map(|&(start, end)| start..=end).collect();
    uids.sort_unstable();
    uids.dedup();
    Ok(uids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    fn read_all(input: &[u8]) -> Vec<RawResponse> {
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        let mut responses = ResponseReader::new();
        let mut out = Vec::new();
        while let Ok(raw) = responses.read_response(&mut reader) {
            out.push(raw);
        }
        out
    }

    fn parse(line: &str) -> Response {
        parse_wire(&format!("{}\r\n", line))
    }

    fn parse_wire(wire: &str) -> Response {
        let mut reader = BufReader::new(Cursor::new(wire.as_bytes().to_vec()));
        let raw = ResponseReader::new().read_response(&mut reader).unwrap();
        parse_response(raw).unwrap()
    }

    fn list_of(response: Response) -> (ListKind, Vec<String>, Option<char>, String) {
        match response {
            Response::Untagged(Untagged::List {
                kind,
                attributes,
                delimiter,
                name,
            }) => (kind, attributes, delimiter, name),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reader_accepts_bare_lf_and_crlf() {
        let out = read_all(b"* OK ready\r\n* 3 EXISTS\nA1 OK done\r\n");
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].bytes, b"* 3 EXISTS\r\n");
        assert_eq!(out[2].first_line(), "A1 OK done");
    }

    #[test]
    fn test_reader_collects_literals() {
        let out = read_all(b"* 1 FETCH (UID 7 BODY[] {5}\r\nHello)\r\nA2 OK done\r\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bytes, b"* 1 FETCH (UID 7 BODY[] {5}\r\nHello)\r\n");
        assert_eq!(out[0].first_line(), "* 1 FETCH (UID 7 BODY[] {5}");
    }

    /// Delivers its bytes in small pieces and times out between pieces.
    struct Trickle {
        chunks: Vec<Vec<u8>>,
        timed_out: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "timeout"));
            }
            self.timed_out = false;
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_reader_keeps_partial_input_across_timeouts() {
        let trickle = Trickle {
            chunks: vec![
                b"* 2 FETCH (BODY[] {4}".to_vec(),
                b"\r\nab".to_vec(),
                b"cd)\r".to_vec(),
                b"\n".to_vec(),
            ],
            timed_out: false,
        };
        let mut reader = BufReader::with_capacity(8, trickle);
        let mut responses = ResponseReader::new();
        let mut timeouts = 0;
        let raw = loop {
            match responses.read_response(&mut reader) {
                Ok(raw) => break raw,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    timeouts += 1;
                    assert!(timeouts < 50);
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        };
        assert_eq!(raw.bytes, b"* 2 FETCH (BODY[] {4}\r\nabcd)\r\n");
        assert!(!responses.has_partial());
    }

    #[test]
    fn test_reader_rejects_eof_mid_line() {
        let mut reader = BufReader::new(Cursor::new(b"* OK trunc".to_vec()));
        let err = ResponseReader::new().read_response(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_reader_rejects_overlong_line() {
        let mut input = b"* OK ".to_vec();
        input.extend(std::iter::repeat(b'x').take(MAX_LINE_LENGTH));
        input.extend_from_slice(b"\r\n* OK after\r\n");
        let mut reader = BufReader::new(Cursor::new(input));
        let mut responses = ResponseReader::new();
        let err = responses.read_response(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!responses.has_partial());
    }

    #[test]
    fn test_reader_caps_line_split_across_timeouts() {
        let half = vec![b'y'; MAX_LINE_LENGTH / 2 + 1];
        let trickle = Trickle {
            chunks: vec![half.clone(), half],
            timed_out: false,
        };
        let mut reader = BufReader::with_capacity(MAX_LINE_LENGTH, trickle);
        let mut responses = ResponseReader::new();
        let err = loop {
            match responses.read_response(&mut reader) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => break e,
                Ok(raw) => panic!("unexpected response {:?}", raw.first_line()),
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_literal_size_marker() {
        assert_eq!(literal_size(b"A1 LOGIN {5}"), Some(5));
        assert_eq!(literal_size(b"A1 LOGIN {12+}"), Some(12));
        assert_eq!(literal_size(b"* OK {not}"), None);
        assert_eq!(literal_size(b"* OK {}"), None);
    }

    #[test]
    fn test_parse_tagged_with_code() {
        match parse("A7 NO [AUTHENTICATIONFAILED] Invalid credentials") {
            Response::Tagged { tag, status } => {
                assert_eq!(tag, "A7");
                assert_eq!(status.status, Status::No);
                assert_eq!(status.code.unwrap().name(), "AUTHENTICATIONFAILED");
                assert_eq!(status.text, "Invalid credentials");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_greeting_capability_code() {
        match parse("* OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] ready") {
            Response::Untagged(Untagged::Status(status)) => {
                assert_eq!(
                    status.code,
                    Some(ResponseCode::Capability(vec![
                        "IMAP4rev1".into(),
                        "STARTTLS".into(),
                        "AUTH=PLAIN".into()
                    ]))
                );
                assert_eq!(status.text, "ready");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_select_codes() {
        match parse("* OK [UIDVALIDITY 3857529045] UIDs valid") {
            Response::Untagged(Untagged::Status(status)) => {
                assert_eq!(status.code, Some(ResponseCode::UidValidity(3857529045)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse("A2 OK [READ-ONLY] EXAMINE completed") {
            Response::Tagged { status, .. } => assert_eq!(status.code, Some(ResponseCode::ReadOnly)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_continuation() {
        assert_eq!(parse("+ PDE4OTYuNjk3"), Response::Continuation("PDE4OTYuNjk3".into()));
        assert_eq!(parse("+"), Response::Continuation(String::new()));
    }

    #[test]
    fn test_parse_list_variants() {
        let (kind, attributes, delimiter, name) =
            list_of(parse("* LIST (\\HasNoChildren \\Trash) \".\" \"INBOX.Trash\""));
        assert_eq!(kind, ListKind::List);
        assert_eq!(attributes, vec!["\\HasNoChildren", "\\Trash"]);
        assert_eq!(delimiter, Some('.'));
        assert_eq!(name, "INBOX.Trash");

        let (kind, _, delimiter, name) = list_of(parse("* LSUB () NIL Archive"));
        assert_eq!(kind, ListKind::Lsub);
        assert_eq!(delimiter, None);
        assert_eq!(name, "Archive");

        let (kind, attributes, _, name) = list_of(parse("* XLIST (\\Noselect) \"/\" \"[Gmail]\""));
        assert_eq!(kind, ListKind::Xlist);
        assert_eq!(attributes, vec!["\\Noselect"]);
        assert_eq!(name, "[Gmail]");
    }

    #[test]
    fn test_parse_list_atom_with_angle_bracket() {
        let (_, _, delimiter, name) = list_of(parse("* LIST () \"/\" a<b"));
        assert_eq!(delimiter, Some('/'));
        assert_eq!(name, "a<b");

        let (_, _, _, name) = list_of(parse("* LIST () \"/\" x<1>y"));
        assert_eq!(name, "x<1>y");
    }

    #[test]
    fn test_parse_list_literal_name() {
        let (_, attributes, delimiter, name) =
            list_of(parse_wire("* LIST (\\HasNoChildren) \"/\" {9}\r\nWork \"Q1\"\r\n"));
        assert_eq!(attributes, vec!["\\HasNoChildren"]);
        assert_eq!(delimiter, Some('/'));
        assert_eq!(name, "Work \"Q1\"");
    }

    #[test]
    fn test_parse_list_nil_delimiter() {
        let (_, _, delimiter, name) = list_of(parse("* LIST (\\Noinferiors) NIL \"Flat\""));
        assert_eq!(delimiter, None);
        assert_eq!(name, "Flat");
    }

    #[test]
    fn test_parse_fetch_flags_and_body() {
        let wire = "* 12 FETCH (UID 40 FLAGS (\\Seen $Label1) RFC822.SIZE 2048 BODY[HEADER.FIELDS (FROM SUBJECT)] {6}\r\nFrom:\n)\r\n";
        match parse_wire(wire) {
            Response::Untagged(Untagged::Fetch { seq, data }) => {
                assert_eq!(seq, 12);
                assert_eq!(data.uid, Some(40));
                assert_eq!(data.flags, Some(vec!["\\Seen".into(), "$Label1".into()]));
                assert_eq!(data.size, Some(2048));
                assert_eq!(data.sections.len(), 1);
                assert_eq!(data.sections[0].section, "HEADER");
                assert_eq!(data.sections[0].data.as_deref(), Some(&b"From:\n"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_fetch_header_fields_followed_by_item() {
        let wire = "* 3 FETCH (BODY[HEADER.FIELDS (A B)] {4}\r\nA: 1 UID 9 FLAGS (\\Answered))\r\n";
        match parse_wire(wire) {
            Response::Untagged(Untagged::Fetch { seq, data }) => {
                assert_eq!(seq, 3);
                assert_eq!(data.uid, Some(9));
                assert_eq!(data.flags, Some(vec!["\\Answered".into()]));
                assert_eq!(data.sections[0].data.as_deref(), Some(&b"A: 1"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_fetch_partial_origin() {
        match parse_wire("* 1 FETCH (UID 9 BODY[]<4096> {3}\r\nabc)\r\n") {
            Response::Untagged(Untagged::Fetch { data, .. }) => {
                assert_eq!(data.sections[0].origin, Some(4096));
                assert_eq!(data.sections[0].section, "");
                assert_eq!(data.sections[0].data.as_deref(), Some(&b"abc"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_misc_untagged() {
        assert_eq!(parse("* 4 EXPUNGE"), Response::Untagged(Untagged::Expunge(4)));
        assert_eq!(parse("* 10 EXISTS"), Response::Untagged(Untagged::Exists(10)));
        assert_eq!(
            parse("* SEARCH 2 5 8"),
            Response::Untagged(Untagged::Search(vec![2, 5, 8]))
        );
        assert_eq!(
            parse("* MYRIGHTS INBOX lrswipkxte"),
            Response::Untagged(Untagged::MyRights {
                mailbox: "INBOX".into(),
                rights: "lrswipkxte".into()
            })
        );
        assert_eq!(
            parse("* QUOTA \"\" (STORAGE 10 512)"),
            Response::Untagged(Untagged::Quota {
                root: "".into(),
                resources: vec![("STORAGE".into(), 10, 512)]
            })
        );
        match parse("* NAMESPACE ((\"\" \"/\")) NIL NIL") {
            Response::Untagged(Untagged::Namespace(ns)) => assert_eq!(ns.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        match parse("* BYE Autologout") {
            Response::Untagged(Untagged::Status(status)) => assert_eq!(status.status, Status::Bye),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            parse("* ENABLED CONDSTORE QRESYNC"),
            Response::Untagged(Untagged::Enabled(vec!["CONDSTORE".into(), "QRESYNC".into()]))
        );
    }

    #[test]
    fn test_parse_esearch_expands_ranges() {
        assert_eq!(
            parse("* ESEARCH (TAG \"A5\") UID ALL 1:3,7,10:9"),
            Response::Untagged(Untagged::Search(vec![1, 2, 3, 7, 9, 10]))
        );
        assert_eq!(
            parse("* ESEARCH (TAG \"A6\") UID MIN 4 MAX 12 COUNT 5"),
            Response::Untagged(Untagged::Search(vec![4, 12]))
        );
        assert_eq!(
            parse("* ESEARCH (TAG \"A7\") UID"),
            Response::Untagged(Untagged::Search(Vec::new()))
        );
    }

    #[test]
    fn test_parse_esearch_rejects_huge_range() {
        let raw = RawResponse::new(b"* ESEARCH UID ALL 1:4000000000\r\n".to_vec());
        assert!(matches!(parse_response(raw), Err(ImapError::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_response(RawResponse::new(b"garbage\r\n".to_vec())).is_err());
        assert!(matches!(
            parse("* XYZZY whatever"),
            Response::Untagged(Untagged::Other(_))
        ));
        assert!(string(b"\"unterminated").is_err());
        assert!(string(b"{3}\r\nab").is_err());
    }
}
