use serde::{Deserialize, Serialize};

use crate::models::bypass_plan::{AppliedEdit, StrategySummary};

/// Inner NFC_DATA envelope and HTTP relay request body.
///
/// TLV bytes are extracted following a strict precedence over these
/// fields; see the frame codec. Unknown fields are ignored so that
/// ancillary client data passes through without breaking decoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_tlv_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlv_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlv_bytes_b64: Option<String>,
    /// `TAG:VALUE|TAG:VALUE` shorthand; VALUE is hex when even-length hex,
    /// otherwise UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlv_data: Option<String>,
    /// POS, ATM, Mobile, Transit or Contactless; defaults to POS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_type: Option<String>,
}

/// Applied-modification summary carried in every relay response.
#[derive(Debug, Clone, Serialize)]
pub struct MitmSummary {
    pub applied_edits: Vec<AppliedEdit>,
    pub strategy: StrategySummary,
    pub signature_tag_present: bool,
    pub success_probability: f64,
}

/// NFC_DATA response envelope and HTTP relay response body.
#[derive(Debug, Clone, Serialize)]
pub struct RelayResponse {
    pub modified_tlv_hex: String,
    pub mitm: MitmSummary,
}

/// Body of ERROR frames: a taxonomy code plus a short message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Body of STATUS frames and the HTTP health probe.
#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub frames_processed: u64,
}

/// CONFIG frame body. Only these four toggles may be changed over the
/// wire; `block_all` and the key path are reserved to the admin surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigBody {
    #[serde(default)]
    pub mitm_enabled: Option<bool>,
    #[serde(default)]
    pub bypass_pin: Option<bool>,
    #[serde(default)]
    pub cdcvm_enabled: Option<bool>,
    #[serde(default)]
    pub enhanced_limits: Option<bool>,
}
