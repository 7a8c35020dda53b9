//! Core domain model for CSPF: carriers, storage tiers, and collected records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cspf-core";

/// Mobile network operators whose subsidy/price tables are collected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Carrier {
    #[serde(rename = "SK")]
    Skt,
    #[serde(rename = "KT")]
    Kt,
    #[serde(rename = "LG")]
    LgUplus,
}

impl Carrier {
    pub const ALL: [Carrier; 3] = [Carrier::Skt, Carrier::Kt, Carrier::LgUplus];

    /// Short code used in task ids, file names, and exports.
    pub fn code(&self) -> &'static str {
        match self {
            Carrier::Skt => "SK",
            Carrier::Kt => "KT",
            Carrier::LgUplus => "LG",
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
#[error("unknown carrier: {0:?}")]
pub struct ParseCarrierError(String);

impl FromStr for Carrier {
    type Err = ParseCarrierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SK" | "SKT" => Ok(Carrier::Skt),
            "KT" => Ok(Carrier::Kt),
            "LG" | "LGU" | "LGU+" => Ok(Carrier::LgUplus),
            _ => Err(ParseCarrierError(s.to_string())),
        }
    }
}

/// Canonical storage capacity tier of a device SKU.
///
/// Raw crawled strings (`"256GB"`, `"256 GB"`, `"1TB"`, `"N/A"`) parse into a
/// typed tier; serialization round-trips through the canonical display form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum StorageTier {
    Gigabytes(u32),
    Terabytes(u32),
    /// Wearables and similar devices without a storage SKU dimension.
    NotApplicable,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTier::Gigabytes(n) => write!(f, "{n}GB"),
            StorageTier::Terabytes(n) => write!(f, "{n}TB"),
            StorageTier::NotApplicable => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unrecognized storage tier: {0:?}")]
pub struct ParseStorageError(String);

impl FromStr for StorageTier {
    type Err = ParseStorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if compact.is_empty() {
            return Err(ParseStorageError(s.to_string()));
        }
        if compact == "N/A" || compact == "NA" {
            return Ok(StorageTier::NotApplicable);
        }
        let (digits, unit) = compact.split_at(
            compact
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(compact.len()),
        );
        let value: u32 = digits
            .parse()
            .map_err(|_| ParseStorageError(s.to_string()))?;
        match unit {
            "GB" | "G" => Ok(StorageTier::Gigabytes(value)),
            "TB" | "T" => Ok(StorageTier::Terabytes(value)),
            _ => Err(ParseStorageError(s.to_string())),
        }
    }
}

impl From<StorageTier> for String {
    fn from(tier: StorageTier) -> Self {
        tier.to_string()
    }
}

impl TryFrom<String> for StorageTier {
    type Error = ParseStorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Subscription (join) type of a subsidy offer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionType {
    NewSignup,
    NumberTransfer,
    DeviceChange,
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionType::NewSignup => "new-signup",
            SubscriptionType::NumberTransfer => "number-transfer",
            SubscriptionType::DeviceChange => "device-change",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("unknown subscription type: {0:?}")]
pub struct ParseSubscriptionError(String);

impl FromStr for SubscriptionType {
    type Err = ParseSubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Carrier front-ends print the Korean labels; exports use the kebab names.
        match s.trim() {
            "신규가입" | "신규" | "new-signup" => Ok(SubscriptionType::NewSignup),
            "번호이동" | "번이" | "number-transfer" => Ok(SubscriptionType::NumberTransfer),
            "기기변경" | "기변" | "device-change" => Ok(SubscriptionType::DeviceChange),
            _ => Err(ParseSubscriptionError(s.to_string())),
        }
    }
}

/// Whether the subsidy is the published device subsidy or the 25% plan
/// contract discount.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SupportType {
    PublicSubsidy,
    ContractDiscount,
}

impl fmt::Display for SupportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupportType::PublicSubsidy => "public-subsidy",
            SupportType::ContractDiscount => "contract-discount",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("unknown support type: {0:?}")]
pub struct ParseSupportTypeError(String);

impl FromStr for SupportType {
    type Err = ParseSupportTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "공시지원금" | "공시" | "public-subsidy" => Ok(SupportType::PublicSubsidy),
            "선택약정" | "선약" | "contract-discount" => Ok(SupportType::ContractDiscount),
            _ => Err(ParseSupportTypeError(s.to_string())),
        }
    }
}

/// A collected subsidy row for one device/plan/subscription combination.
///
/// All currency fields are in won (smallest currency unit). Immutable once
/// appended to a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportRecord {
    pub carrier: Carrier,
    pub raw_device_label: String,
    pub storage_raw: String,
    pub rate_plan: String,
    pub monthly_fee: u64,
    pub subscription_type: SubscriptionType,
    pub support_type: SupportType,
    pub total_support_fee: u64,
    pub collected_at: DateTime<Utc>,
}

/// A collected list-price row for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub carrier: Carrier,
    pub raw_device_label: String,
    pub storage_raw: String,
    pub release_price: u64,
    pub collected_at: DateTime<Utc>,
}

/// Unit-of-work output: what a collector produces and a checkpoint persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectedRecord {
    Support(SupportRecord),
    Price(PriceRecord),
}

impl CollectedRecord {
    pub fn carrier(&self) -> Carrier {
        match self {
            CollectedRecord::Support(r) => r.carrier,
            CollectedRecord::Price(r) => r.carrier,
        }
    }

    pub fn raw_device_label(&self) -> &str {
        match self {
            CollectedRecord::Support(r) => &r.raw_device_label,
            CollectedRecord::Price(r) => &r.raw_device_label,
        }
    }

    pub fn is_support(&self) -> bool {
        matches!(self, CollectedRecord::Support(_))
    }
}

/// Canonical device identity used to join records across carriers.
///
/// The same raw label may map to different storage SKUs per carrier, so the
/// storage tier is part of the identity, not an attribute of the label.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceIdentity {
    pub product_group: String,
    pub storage: StorageTier,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.product_group, self.storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_parses_common_spellings() {
        assert_eq!("SK".parse::<Carrier>().unwrap(), Carrier::Skt);
        assert_eq!("skt".parse::<Carrier>().unwrap(), Carrier::Skt);
        assert_eq!(" KT ".parse::<Carrier>().unwrap(), Carrier::Kt);
        assert_eq!("LGU+".parse::<Carrier>().unwrap(), Carrier::LgUplus);
        assert!("Verizon".parse::<Carrier>().is_err());
    }

    #[test]
    fn storage_tier_parses_raw_spellings() {
        assert_eq!(
            "256GB".parse::<StorageTier>().unwrap(),
            StorageTier::Gigabytes(256)
        );
        assert_eq!(
            "256 GB".parse::<StorageTier>().unwrap(),
            StorageTier::Gigabytes(256)
        );
        assert_eq!(
            "1TB".parse::<StorageTier>().unwrap(),
            StorageTier::Terabytes(1)
        );
        assert_eq!(
            "1T".parse::<StorageTier>().unwrap(),
            StorageTier::Terabytes(1)
        );
        assert_eq!(
            "n/a".parse::<StorageTier>().unwrap(),
            StorageTier::NotApplicable
        );
        assert!("대용량".parse::<StorageTier>().is_err());
        assert!("".parse::<StorageTier>().is_err());
    }

    #[test]
    fn storage_tier_serde_round_trips_as_display_string() {
        let json = serde_json::to_string(&StorageTier::Gigabytes(512)).unwrap();
        assert_eq!(json, "\"512GB\"");
        let back: StorageTier = serde_json::from_str("\"512 gb\"").unwrap();
        assert_eq!(back, StorageTier::Gigabytes(512));
    }

    #[test]
    fn subscription_type_parses_korean_labels() {
        assert_eq!(
            "번호이동".parse::<SubscriptionType>().unwrap(),
            SubscriptionType::NumberTransfer
        );
        assert_eq!(
            "기변".parse::<SubscriptionType>().unwrap(),
            SubscriptionType::DeviceChange
        );
        assert_eq!(
            "new-signup".parse::<SubscriptionType>().unwrap(),
            SubscriptionType::NewSignup
        );
    }

    #[test]
    fn collected_record_serde_is_tagged_by_kind() {
        let record = CollectedRecord::Price(PriceRecord {
            carrier: Carrier::Kt,
            raw_device_label: "플립7".to_string(),
            storage_raw: "256GB".to_string(),
            release_price: 1_980_000,
            collected_at: Utc::now(),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "price");
        assert_eq!(json["carrier"], "KT");
        let back: CollectedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn device_identity_orders_by_group_then_storage() {
        let a = DeviceIdentity {
            product_group: "갤럭시 Z 플립 7".to_string(),
            storage: StorageTier::Gigabytes(256),
        };
        let b = DeviceIdentity {
            product_group: "갤럭시 Z 플립 7".to_string(),
            storage: StorageTier::Gigabytes(512),
        };
        assert!(a < b);
    }
}
