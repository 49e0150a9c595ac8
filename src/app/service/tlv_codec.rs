use std::fmt;

use tracing::{debug, warn};

use crate::models::bypass_plan::{BypassPlan, TlvEdit};

/// Tags that modification plans must never touch: PAN, expiry,
/// cryptogram material and issuer public-key data.
pub const PROTECTED_TAGS: &[&str] = &["5A", "5F24", "9F26", "9F27", "9F36", "90", "92", "9F32"];

pub fn is_protected_tag(tag: &str) -> bool {
    PROTECTED_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

/// Tag class from bits 7-8 of the first tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

/// Primitive vs constructed, bit 6 of the first tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagForm {
    Primitive,
    Constructed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    Primitive(Vec<u8>),
    Constructed(Vec<TlvNode>),
}

/// One parsed BER-TLV element.
///
/// The wire encoding of the length field is retained so that untouched
/// subtrees serialize back byte-exact even when the encoder used a
/// non-minimal long form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    tag: Vec<u8>,
    value: TlvValue,
    original_length: Option<Vec<u8>>,
}

impl TlvNode {
    /// New primitive node with a minimal length encoding.
    pub fn primitive(tag: &str, value: Vec<u8>) -> Result<Self, TlvParseError> {
        let tag_bytes = hex_to_bytes(tag)?;
        if tag_bytes.is_empty() || tag_bytes[0] == 0x00 {
            return Err(TlvParseError::EmptyTagByte);
        }
        Ok(Self {
            tag: tag_bytes,
            value: TlvValue::Primitive(value),
            original_length: None,
        })
    }

    pub fn tag_bytes(&self) -> &[u8] {
        &self.tag
    }

    pub fn tag_hex(&self) -> String {
        hex::encode_upper(&self.tag)
    }

    pub fn class(&self) -> TagClass {
        match self.tag[0] >> 6 {
            0b00 => TagClass::Universal,
            0b01 => TagClass::Application,
            0b10 => TagClass::Context,
            _ => TagClass::Private,
        }
    }

    pub fn form(&self) -> TagForm {
        match &self.value {
            TlvValue::Primitive(_) => TagForm::Primitive,
            TlvValue::Constructed(_) => TagForm::Constructed,
        }
    }

    /// Raw bytes of a primitive node; `None` for constructed nodes.
    pub fn primitive_value(&self) -> Option<&[u8]> {
        match &self.value {
            TlvValue::Primitive(v) => Some(v),
            TlvValue::Constructed(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[TlvNode]> {
        match &self.value {
            TlvValue::Primitive(_) => None,
            TlvValue::Constructed(c) => Some(c),
        }
    }

    pub fn value_hex(&self) -> String {
        hex::encode_upper(self.content_bytes())
    }

    /// Replace the value, dropping the retained wire length.
    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = TlvValue::Primitive(value);
        self.original_length = None;
    }

    fn content_bytes(&self) -> Vec<u8> {
        match &self.value {
            TlvValue::Primitive(v) => v.clone(),
            TlvValue::Constructed(children) => {
                let mut out = Vec::new();
                for child in children {
                    child.serialize_into(&mut out);
                }
                out
            }
        }
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        let content = self.content_bytes();
        out.extend_from_slice(&self.tag);
        match &self.original_length {
            Some(wire) if decode_wire_length(wire) == Some(content.len()) => {
                out.extend_from_slice(wire);
            }
            _ => out.extend_from_slice(&encode_length(content.len())),
        }
        out.extend_from_slice(&content);
    }
}

impl fmt::Display for TlvNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag: {}, Value: {}", self.tag_hex(), self.value_hex())
    }
}

/// Ordered sequence of top-level TLV nodes.
///
/// This is deliberately a sequence and not a map: duplicate tags are
/// legal and every lookup returns the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvSet {
    nodes: Vec<TlvNode>,
}

impl TlvSet {
    pub fn nodes(&self) -> &[TlvNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: TlvNode) {
        self.nodes.push(node);
    }

    /// First top-level node with the given hex tag.
    pub fn find(&self, tag: &str) -> Option<&TlvNode> {
        self.nodes
            .iter()
            .find(|n| n.tag_hex().eq_ignore_ascii_case(tag))
    }

    /// Depth-first search across constructed nodes; first match wins.
    /// Card data frequently arrives nested inside template tags (70/77),
    /// so the analyzer reads through this instead of `find`.
    pub fn find_deep(&self, tag: &str) -> Option<&TlvNode> {
        fn walk<'a>(nodes: &'a [TlvNode], tag: &str) -> Option<&'a TlvNode> {
            for node in nodes {
                if node.tag_hex().eq_ignore_ascii_case(tag) {
                    return Some(node);
                }
                if let Some(children) = node.children() {
                    if let Some(found) = walk(children, tag) {
                        return Some(found);
                    }
                }
            }
            None
        }
        walk(&self.nodes, tag)
    }
}

/// Parse a BER-TLV byte stream.
///
/// Strict at the top level; inside a constructed node a failing child
/// parse demotes the node to an opaque primitive instead of failing the
/// whole stream, because inner blobs may be proprietary non-TLV.
pub fn parse(bytes: &[u8]) -> Result<TlvSet, TlvParseError> {
    let mut nodes = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let (node, consumed) = parse_node(&bytes[pos..])?;
        debug!("parsed TLV tag {} ({} bytes)", node.tag_hex(), consumed);
        nodes.push(node);
        pos += consumed;
    }

    Ok(TlvSet { nodes })
}

/// Parse a hex string containing TLV encoded data.
pub fn parse_hex(hex_string: &str) -> Result<TlvSet, TlvParseError> {
    parse(&hex_to_bytes(hex_string)?)
}

fn parse_node(bytes: &[u8]) -> Result<(TlvNode, usize), TlvParseError> {
    let (tag, tag_len) = parse_tag(bytes)?;
    let (length, len_bytes, wire_len) = parse_length(&bytes[tag_len..])?;

    let value_start = tag_len + len_bytes;
    if value_start + length > bytes.len() {
        return Err(TlvParseError::TruncatedBuffer);
    }
    let raw_value = &bytes[value_start..value_start + length];

    let constructed = tag[0] & 0b0010_0000 != 0;
    let value = if constructed {
        match parse(raw_value) {
            Ok(children) => TlvValue::Constructed(children.nodes),
            Err(e) => {
                warn!(
                    "constructed tag {} does not recurse ({}); keeping raw bytes",
                    hex::encode_upper(&tag),
                    e
                );
                TlvValue::Primitive(raw_value.to_vec())
            }
        }
    } else {
        TlvValue::Primitive(raw_value.to_vec())
    };

    Ok((
        TlvNode {
            tag,
            value,
            original_length: Some(wire_len),
        },
        value_start + length,
    ))
}

/// Parse a tag field, returns (tag bytes, bytes consumed).
///
/// If the low 5 bits of the first byte are all set, subsequent bytes
/// belong to the tag until one with the high bit clear.
fn parse_tag(bytes: &[u8]) -> Result<(Vec<u8>, usize), TlvParseError> {
    let first = *bytes.first().ok_or(TlvParseError::TruncatedBuffer)?;
    if first == 0x00 {
        return Err(TlvParseError::EmptyTagByte);
    }

    if first & 0x1F != 0x1F {
        return Ok((vec![first], 1));
    }

    let mut tag = vec![first];
    for &b in &bytes[1..] {
        tag.push(b);
        if b & 0x80 == 0 {
            let consumed = tag.len();
            return Ok((tag, consumed));
        }
    }
    Err(TlvParseError::TruncatedBuffer)
}

/// Parse a length field, returns (length, bytes consumed, wire bytes).
fn parse_length(bytes: &[u8]) -> Result<(usize, usize, Vec<u8>), TlvParseError> {
    let first = *bytes.first().ok_or(TlvParseError::TruncatedBuffer)?;

    if first < 0x80 {
        return Ok((first as usize, 1, vec![first]));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 4 {
        return Err(TlvParseError::OverlongLength(first));
    }
    if bytes.len() < 1 + count {
        return Err(TlvParseError::TruncatedBuffer);
    }

    let mut length = 0usize;
    for &b in &bytes[1..=count] {
        length = (length << 8) | b as usize;
    }
    Ok((length, 1 + count, bytes[..=count].to_vec()))
}

/// Decode a retained wire length field back to its value.
fn decode_wire_length(wire: &[u8]) -> Option<usize> {
    match wire {
        [single] if *single < 0x80 => Some(*single as usize),
        [first, rest @ ..] if (*first & 0x7F) as usize == rest.len() => {
            Some(rest.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
        }
        _ => None,
    }
}

/// Minimal BER length encoding.
pub fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len <= 0xFF {
        vec![0x81, len as u8]
    } else if len <= 0xFFFF {
        vec![0x82, (len >> 8) as u8, len as u8]
    } else if len <= 0xFF_FFFF {
        vec![0x83, (len >> 16) as u8, (len >> 8) as u8, len as u8]
    } else {
        vec![
            0x84,
            (len >> 24) as u8,
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
        ]
    }
}

/// Serialize a TLV set. Untouched nodes reuse their wire length
/// encoding; new or modified nodes get the minimal form.
pub fn serialize(set: &TlvSet) -> Vec<u8> {
    let mut out = Vec::new();
    for node in &set.nodes {
        node.serialize_into(&mut out);
    }
    out
}

/// Apply an ordered edit plan to a TLV set.
///
/// Edits are applied in list order; the result of edit *i* feeds edit
/// *i+1*. A plan naming a protected tag is a programmer error and is
/// rejected before any edit runs.
pub fn apply(set: &TlvSet, plan: &BypassPlan) -> Result<TlvSet, EditError> {
    for edit in &plan.edits {
        if is_protected_tag(edit.target_tag()) {
            return Err(EditError::ProtectedTag(edit.target_tag().to_string()));
        }
    }

    let mut out = set.clone();
    for edit in &plan.edits {
        apply_edit(&mut out, edit)?;
    }
    Ok(out)
}

fn apply_edit(set: &mut TlvSet, edit: &TlvEdit) -> Result<(), EditError> {
    match edit {
        TlvEdit::Replace { tag, value } => {
            let existing = set
                .nodes
                .iter_mut()
                .find(|n| n.tag_hex().eq_ignore_ascii_case(tag));
            match existing {
                Some(node) => node.set_value(value.clone()),
                None => set.nodes.push(
                    TlvNode::primitive(tag, value.clone())
                        .map_err(|_| EditError::BadTag(tag.clone()))?,
                ),
            }
        }
        TlvEdit::Remove { tag } => {
            if let Some(idx) = set
                .nodes
                .iter()
                .position(|n| n.tag_hex().eq_ignore_ascii_case(tag))
            {
                set.nodes.remove(idx);
            }
        }
        TlvEdit::Insert { tag, value, before } => {
            let node = TlvNode::primitive(tag, value.clone())
                .map_err(|_| EditError::BadTag(tag.clone()))?;
            let idx = before
                .as_ref()
                .and_then(|b| {
                    set.nodes
                        .iter()
                        .position(|n| n.tag_hex().eq_ignore_ascii_case(b))
                })
                .unwrap_or(set.nodes.len());
            set.nodes.insert(idx, node);
        }
    }
    Ok(())
}

/// Convert a hex string to bytes, tolerating whitespace.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, TlvParseError> {
    let clean = hex_str.trim().replace(' ', "");
    if clean.len() % 2 != 0 {
        return Err(TlvParseError::InvalidHexLength);
    }
    hex::decode(&clean).map_err(|_| TlvParseError::InvalidHexChar(clean))
}

/// Errors that can occur during TLV parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvParseError {
    TruncatedBuffer,
    OverlongLength(u8),
    EmptyTagByte,
    InvalidHexLength,
    InvalidHexChar(String),
}

impl fmt::Display for TlvParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlvParseError::TruncatedBuffer => write!(f, "Declared length exceeds remaining bytes"),
            TlvParseError::OverlongLength(b) => {
                write!(f, "Unsupported long-form length (first byte 0x{:02X})", b)
            }
            TlvParseError::EmptyTagByte => write!(f, "Zero tag byte where a tag is required"),
            TlvParseError::InvalidHexLength => write!(f, "Hex string has odd length"),
            TlvParseError::InvalidHexChar(s) => write!(f, "Invalid hex characters: {}", s),
        }
    }
}

impl std::error::Error for TlvParseError {}

/// Errors from applying an edit plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    /// The plan targets a tag in the protected set.
    ProtectedTag(String),
    BadTag(String),
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditError::ProtectedTag(tag) => write!(f, "Edit targets protected tag {}", tag),
            EditError::BadTag(tag) => write!(f, "Edit carries an invalid tag {}", tag),
        }
    }
}

impl std::error::Error for EditError {}

/// Common EMV tags with their descriptions, for logging only.
pub struct EmvTags;

impl EmvTags {
    pub fn get_description(tag: &str) -> &'static str {
        match tag {
            "4F" => "Application Identifier (AID)",
            "50" => "Application Label",
            "57" => "Track 2 Equivalent Data",
            "5A" => "Application Primary Account Number (PAN)",
            "5F20" => "Cardholder Name",
            "5F24" => "Application Expiration Date",
            "5F28" => "Issuer Country Code",
            "5F2A" => "Transaction Currency Code",
            "82" => "Application Interchange Profile (AIP)",
            "84" => "Dedicated File (DF) Name",
            "8E" => "Cardholder Verification Method (CVM) List",
            "90" => "Issuer Public Key Certificate",
            "92" => "Issuer Public Key Remainder",
            "95" => "Terminal Verification Results (TVR)",
            "9F07" => "Application Usage Control",
            "9F10" => "Issuer Application Data (IAD)",
            "9F1A" => "Terminal Country Code",
            "9F1B" => "Terminal Floor Limit",
            "9F26" => "Application Cryptogram (AC)",
            "9F27" => "Cryptogram Information Data (CID)",
            "9F32" => "Issuer Public Key Exponent",
            "9F33" => "Terminal Capabilities",
            "9F34" => "Cardholder Verification Method (CVM) Results",
            "9F36" => "Application Transaction Counter (ATC)",
            "9F45" => "Data Authentication Code",
            "9F51" => "Application Currency Code",
            "9F6C" => "Card Transaction Qualifiers (CTQ)",
            _ => "Unknown Tag",
        }
    }
}
