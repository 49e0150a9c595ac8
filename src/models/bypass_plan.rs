use serde::Serialize;

/// One ordered modification of a TLV set.
///
/// Tags are uppercase hex strings matching the codec's tag accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvEdit {
    /// Replace the first top-level occurrence, or insert at the end if absent.
    Replace { tag: String, value: Vec<u8> },
    /// Remove the first top-level occurrence if present.
    Remove { tag: String },
    /// Insert before the first node whose tag matches `before`, or at the end.
    Insert {
        tag: String,
        value: Vec<u8>,
        before: Option<String>,
    },
}

impl TlvEdit {
    pub fn replace(tag: &str, value: Vec<u8>) -> Self {
        TlvEdit::Replace {
            tag: tag.to_uppercase(),
            value,
        }
    }

    pub fn target_tag(&self) -> &str {
        match self {
            TlvEdit::Replace { tag, .. } => tag,
            TlvEdit::Remove { tag } => tag,
            TlvEdit::Insert { tag, .. } => tag,
        }
    }

    /// Serializable form for the `applied_edits` response field.
    pub fn summarize(&self) -> AppliedEdit {
        match self {
            TlvEdit::Replace { tag, value } => AppliedEdit {
                op: "replace",
                tag: tag.clone(),
                value: Some(hex::encode_upper(value)),
            },
            TlvEdit::Remove { tag } => AppliedEdit {
                op: "remove",
                tag: tag.clone(),
                value: None,
            },
            TlvEdit::Insert { tag, value, .. } => AppliedEdit {
                op: "insert",
                tag: tag.clone(),
                value: Some(hex::encode_upper(value)),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedEdit {
    pub op: &'static str,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Identifies the strategy row a plan was materialized from.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySummary {
    pub name: String,
    pub primary: String,
    pub fallback: String,
    pub terminal: String,
}

/// Ordered edit list plus the observability fields the pipeline reports.
///
/// `blocked` plans carry no edits; the pipeline resolves them to an
/// ERROR(BLOCKED) response instead of a modified frame.
#[derive(Debug, Clone)]
pub struct BypassPlan {
    pub edits: Vec<TlvEdit>,
    pub blocked: bool,
    pub high_risk: bool,
    pub strategy: StrategySummary,
    pub success_probability: f64,
}

impl BypassPlan {
    pub fn blocked() -> Self {
        Self {
            edits: Vec::new(),
            blocked: true,
            high_risk: false,
            strategy: StrategySummary {
                name: "blocked".to_string(),
                primary: "none".to_string(),
                fallback: "none".to_string(),
                terminal: "-".to_string(),
            },
            success_probability: 0.0,
        }
    }
}
