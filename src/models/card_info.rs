use std::fmt;

use serde::Serialize;

/// Card network brand derived from PAN BIN ranges or AID prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Brand {
    Visa,
    Mastercard,
    Amex,
    Discover,
    Jcb,
    UnionPay,
    DinersClub,
    Maestro,
    Unknown,
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Brand::Visa => "Visa",
            Brand::Mastercard => "Mastercard",
            Brand::Amex => "Amex",
            Brand::Discover => "Discover",
            Brand::Jcb => "JCB",
            Brand::UnionPay => "UnionPay",
            Brand::DinersClub => "DinersClub",
            Brand::Maestro => "Maestro",
            Brand::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Card product type derived from Application Usage Control (tag 9F07).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardType {
    Credit,
    Debit,
    Prepaid,
    Business,
    Unknown,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CardType::Credit => "Credit",
            CardType::Debit => "Debit",
            CardType::Prepaid => "Prepaid",
            CardType::Business => "Business",
            CardType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Facts derived from one parsed TLV set.
///
/// The full PAN is never stored here; only the masked form and the
/// six-digit BIN survive the analysis step.
#[derive(Debug, Clone)]
pub struct CardInfo {
    pub brand: Brand,
    pub card_type: CardType,
    pub pan_masked: Option<String>,
    pub aid: Option<Vec<u8>>,
    /// ISO 3166 numeric as 4 uppercase hex digits, zero-padded.
    pub issuer_country: Option<String>,
    pub issuer_country_label: Option<&'static str>,
    /// ISO 4217 numeric as 4 uppercase hex digits, zero-padded.
    pub currency: Option<String>,
    pub currency_label: Option<&'static str>,
    pub bin6: Option<String>,
}

impl CardInfo {
    pub fn unknown() -> Self {
        Self {
            brand: Brand::Unknown,
            card_type: CardType::Unknown,
            pan_masked: None,
            aid: None,
            issuer_country: None,
            issuer_country_label: None,
            currency: None,
            currency_label: None,
            bin6: None,
        }
    }

    pub fn aid_hex(&self) -> Option<String> {
        self.aid.as_ref().map(|a| hex::encode_upper(a))
    }
}

impl fmt::Display for CardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} pan={} country={} currency={}",
            self.brand,
            self.card_type,
            self.pan_masked.as_deref().unwrap_or("-"),
            self.issuer_country_label
                .or(self.issuer_country.as_deref().map(|_| "?"))
                .unwrap_or("-"),
            self.currency_label
                .or(self.currency.as_deref().map(|_| "?"))
                .unwrap_or("-"),
        )
    }
}
