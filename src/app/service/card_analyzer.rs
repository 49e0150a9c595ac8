use once_cell::sync::Lazy;
use tracing::debug;

use crate::app::service::tlv_codec::TlvSet;
use crate::models::card_info::{Brand, CardInfo, CardType};

/// AID prefixes checked when no PAN is available. Longest prefix first
/// so co-badged Maestro applications are not swallowed by the
/// Mastercard RID.
static AID_PREFIXES: Lazy<Vec<(&'static str, Brand)>> = Lazy::new(|| {
    vec![
        ("A0000000043060", Brand::Maestro),
        ("A000000003", Brand::Visa),
        ("A000000004", Brand::Mastercard),
        ("A000000025", Brand::Amex),
        ("A000000065", Brand::Jcb),
        ("A000000152", Brand::Discover),
        ("A000000333", Brand::UnionPay),
    ]
});

/// Derive card facts from a parsed TLV set. Pure function, no I/O.
pub fn analyze(tlv: &TlvSet) -> CardInfo {
    let mut info = CardInfo::unknown();

    let pan = pan_digits(tlv);
    info.aid = tlv
        .find_deep("4F")
        .or_else(|| tlv.find_deep("84"))
        .and_then(|n| n.primitive_value())
        .map(|v| v.to_vec());

    info.brand = match &pan {
        Some(digits) => brand_from_bin(digits),
        None => info
            .aid_hex()
            .map(|aid| brand_from_aid(&aid))
            .unwrap_or(Brand::Unknown),
    };

    if let Some(digits) = &pan {
        if digits.len() >= 6 {
            info.bin6 = Some(digits[..6].to_string());
        }
        if digits.len() >= 4 {
            info.pan_masked = Some(mask_pan(digits));
        }
    }

    info.card_type = card_type_from_auc(tlv);
    if info.card_type == CardType::Unknown && holder_name_is_corporate(tlv) {
        info.card_type = CardType::Business;
    }

    info.issuer_country = read_code(tlv, "5F28", "9F1A");
    info.issuer_country_label = info.issuer_country.as_deref().map(country_label);
    info.currency = read_code(tlv, "5F2A", "9F51");
    info.currency_label = info.currency.as_deref().map(currency_label);

    debug!("analyzed card: {}", info);
    info
}

/// PAN digits from tag 5A, BCD with trailing F padding stripped.
fn pan_digits(tlv: &TlvSet) -> Option<String> {
    let raw = tlv.find_deep("5A")?.primitive_value()?;
    let digits: String = hex::encode_upper(raw)
        .trim_end_matches('F')
        .to_string();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

/// BIN range resolution. Rules are tested in this exact order; the
/// first match wins, so Discover's 622126-622925 slice is carved out
/// of UnionPay's 62 and Maestro's 50xx rows shadow Mastercard's 51-55.
fn brand_from_bin(digits: &str) -> Brand {
    let p2 = prefix(digits, 2);
    let p3 = prefix(digits, 3);
    let p4 = prefix(digits, 4);
    let p6 = prefix(digits, 6);

    if matches!(p2, Some(34) | Some(37)) {
        return Brand::Amex;
    }
    if digits.starts_with("6011")
        || matches!(p3, Some(644..=649))
        || p2 == Some(65)
        || matches!(p6, Some(622126..=622925))
    {
        return Brand::Discover;
    }
    if matches!(p4, Some(3528..=3589)) {
        return Brand::Jcb;
    }
    if matches!(p4, Some(5018) | Some(5020) | Some(5038) | Some(6304)) {
        return Brand::Maestro;
    }
    if matches!(p3, Some(300..=305)) || p4 == Some(3095) || matches!(p2, Some(36) | Some(38) | Some(39)) {
        return Brand::DinersClub;
    }
    if matches!(p2, Some(51..=55)) || matches!(p4, Some(2221..=2720)) {
        return Brand::Mastercard;
    }
    if digits.starts_with('4') {
        return Brand::Visa;
    }
    if p2 == Some(62) {
        return Brand::UnionPay;
    }
    Brand::Unknown
}

fn prefix(digits: &str, n: usize) -> Option<u32> {
    digits.get(..n)?.parse().ok()
}

fn brand_from_aid(aid_hex: &str) -> Brand {
    AID_PREFIXES
        .iter()
        .find(|(prefix, _)| aid_hex.starts_with(prefix))
        .map(|(_, brand)| *brand)
        .unwrap_or(Brand::Unknown)
}

/// Application Usage Control, first byte of tag 9F07.
fn card_type_from_auc(tlv: &TlvSet) -> CardType {
    let Some(first) = tlv
        .find_deep("9F07")
        .and_then(|n| n.primitive_value())
        .and_then(|v| v.first().copied())
    else {
        return CardType::Unknown;
    };
    match first {
        0x08 | 0x18 | 0x28 | 0x48 => CardType::Debit,
        0x00 | 0x01 | 0x02 | 0x04 | 0x40 => CardType::Credit,
        0x20 | 0x21 | 0x22 | 0x24 => CardType::Prepaid,
        0x80 | 0x81 | 0x82 | 0x84 => CardType::Business,
        _ => CardType::Unknown,
    }
}

const CORPORATE_MARKERS: &[&str] = &["CORP", "BUSINESS", "COMPANY", "LLC", "INC", "LTD"];

fn holder_name_is_corporate(tlv: &TlvSet) -> bool {
    let Some(raw) = tlv.find_deep("5F20").and_then(|n| n.primitive_value()) else {
        return false;
    };
    let Ok(name) = std::str::from_utf8(raw) else {
        return false;
    };
    let upper = name.to_uppercase();
    CORPORATE_MARKERS.iter().any(|m| upper.contains(m))
}

/// Numeric ISO code normalized to 4 uppercase hex digits. Values wider
/// than two bytes keep their low two bytes.
fn read_code(tlv: &TlvSet, tag: &str, fallback: &str) -> Option<String> {
    let raw = tlv
        .find_deep(tag)
        .or_else(|| tlv.find_deep(fallback))
        .and_then(|n| n.primitive_value())?;
    if raw.is_empty() {
        return None;
    }
    let tail = if raw.len() > 2 { &raw[raw.len() - 2..] } else { raw };
    let value = tail.iter().fold(0u16, |acc, b| (acc << 8) | *b as u16);
    Some(format!("{:04X}", value))
}

/// Mask a PAN keeping only the last four digits.
fn mask_pan(digits: &str) -> String {
    let last4 = &digits[digits.len() - 4..];
    format!("{}{}", "*".repeat(digits.len() - 4), last4)
}

/// Issuer country label for logging.
pub fn country_label(code: &str) -> &'static str {
    match code {
        "0036" => "Australia",
        "0124" => "Canada",
        "0156" => "China",
        "0276" => "Germany",
        "0392" => "Japan",
        "0410" => "South Korea",
        "0702" => "Singapore",
        "0704" => "Vietnam",
        "0764" => "Thailand",
        "0826" => "United Kingdom",
        "0840" => "United States",
        "0978" => "Eurozone",
        _ => "Unknown",
    }
}

/// Transaction currency label for logging.
pub fn currency_label(code: &str) -> &'static str {
    match code {
        "0036" => "AUD",
        "0124" => "CAD",
        "0156" => "CNY",
        "0392" => "JPY",
        "0410" => "KRW",
        "0702" => "SGD",
        "0704" => "VND",
        "0764" => "THB",
        "0826" => "GBP",
        "0840" => "USD",
        "0978" => "EUR",
        _ => "Unknown",
    }
}
