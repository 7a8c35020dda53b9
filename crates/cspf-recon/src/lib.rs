//! Identity resolution, support/price reconciliation, and net-price computation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use cspf_core::{
    Carrier, CollectedRecord, DeviceIdentity, PriceRecord, StorageTier, SubscriptionType,
    SupportRecord, SupportType,
};
use cspf_storage::write_atomic;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cspf-recon";

// ---------------------------------------------------------------------------
// Identity Resolution Table
// ---------------------------------------------------------------------------

/// One curated mapping row: how a carrier spells a device SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRow {
    pub carrier: Carrier,
    pub raw_label: String,
    pub product_group: String,
    pub storage: StorageTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(DeviceIdentity),
    /// No row for the key. A data-quality signal, not an error.
    Unknown,
    /// Conflicting rows share the key; resolution fails closed rather than
    /// picking one. The table needs a disambiguated key added explicitly.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySlot {
    Unique(usize),
    Conflicted,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("no mapping for ({carrier}, {raw_label:?})")]
    UnknownKey {
        carrier: Carrier,
        raw_label: String,
    },
}

/// Persisted shape of the table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    entries: Vec<ResolutionRow>,
}

/// Versioned, exact-match device identity table.
///
/// Lookup keys are `(carrier, trimmed raw label)`; matching is case-sensitive
/// and internal-whitespace-sensitive, and never fuzzy. Earlier
/// similarity-based matching silently merged unrelated SKUs, so exactness here
/// is a design decision, not an oversight.
#[derive(Debug, Clone)]
pub struct ResolutionTable {
    version: u32,
    updated_at: DateTime<Utc>,
    entries: Vec<ResolutionRow>,
    index: HashMap<(Carrier, String), KeySlot>,
}

impl Default for ResolutionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionTable {
    pub fn new() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn from_rows(rows: Vec<ResolutionRow>) -> Self {
        let mut table = Self::new();
        table.entries = rows;
        table.normalize_labels();
        table.rebuild_index();
        table
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading resolution table {}", path.display()))?;
        let doc: TableDocument = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing resolution table {}", path.display()))?;
        let mut table = Self {
            version: doc.version,
            updated_at: doc.updated_at,
            entries: doc.entries,
            index: HashMap::new(),
        };
        table.normalize_labels();
        table.rebuild_index();
        Ok(table)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let doc = TableDocument {
            version: self.version,
            updated_at: self.updated_at,
            entries: self.entries.clone(),
        };
        let text = serde_yaml::to_string(&doc)
            .with_context(|| format!("encoding resolution table {}", path.display()))?;
        write_atomic(path, text.as_bytes())
            .await
            .with_context(|| format!("writing resolution table {}", path.display()))?;
        Ok(())
    }

    /// Deterministic exact-match lookup. Identical inputs always yield the
    /// identical result for a given table state.
    pub fn resolve(&self, carrier: Carrier, raw_label: &str) -> Resolution {
        match self.index.get(&(carrier, raw_label.trim().to_string())) {
            Some(KeySlot::Unique(pos)) => {
                let row = &self.entries[*pos];
                Resolution::Resolved(DeviceIdentity {
                    product_group: row.product_group.clone(),
                    storage: row.storage,
                })
            }
            Some(KeySlot::Conflicted) => Resolution::Ambiguous,
            None => Resolution::Unknown,
        }
    }

    /// Upsert: replaces any existing rows for the key. Correcting a wrong
    /// mapping is an explicit replace, never an automatic inference.
    pub fn insert(&mut self, mut row: ResolutionRow) {
        row.raw_label = row.raw_label.trim().to_string();
        self.entries
            .retain(|e| !(e.carrier == row.carrier && e.raw_label == row.raw_label));
        self.entries.push(row);
        self.touch();
    }

    pub fn update_storage(
        &mut self,
        carrier: Carrier,
        raw_label: &str,
        storage: StorageTier,
    ) -> Result<(), TableError> {
        let raw_label = raw_label.trim();
        let mut found = false;
        for entry in &mut self.entries {
            if entry.carrier == carrier && entry.raw_label == raw_label {
                entry.storage = storage;
                found = true;
            }
        }
        if !found {
            return Err(TableError::UnknownKey {
                carrier,
                raw_label: raw_label.to_string(),
            });
        }
        self.touch();
        Ok(())
    }

    /// Audit listing: every raw spelling mapped into a product group.
    pub fn entries_for_group(&self, product_group: &str) -> Vec<&ResolutionRow> {
        self.entries
            .iter()
            .filter(|e| e.product_group == product_group)
            .collect()
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
        self.rebuild_index();
    }

    fn normalize_labels(&mut self) {
        for entry in &mut self.entries {
            let trimmed = entry.raw_label.trim();
            if trimmed.len() != entry.raw_label.len() {
                entry.raw_label = trimmed.to_string();
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (pos, entry) in self.entries.iter().enumerate() {
            let key = (entry.carrier, entry.raw_label.clone());
            match self.index.get(&key) {
                None => {
                    self.index.insert(key, KeySlot::Unique(pos));
                }
                Some(KeySlot::Unique(prev)) => {
                    let prev_row = &self.entries[*prev];
                    // Multiple spellings of one SKU collapse; a disagreement
                    // on group or storage poisons the key.
                    if prev_row.product_group != entry.product_group
                        || prev_row.storage != entry.storage
                    {
                        warn!(
                            carrier = %entry.carrier,
                            raw_label = %entry.raw_label,
                            "conflicting table rows for one key; resolution fails closed"
                        );
                        self.index.insert(key, KeySlot::Conflicted);
                    }
                }
                Some(KeySlot::Conflicted) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation Engine
// ---------------------------------------------------------------------------

/// A support row joined to its price row through the resolution table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledOffer {
    pub identity: DeviceIdentity,
    pub carrier: Carrier,
    pub storage: StorageTier,
    pub rate_plan: String,
    pub monthly_fee: u64,
    pub subscription_type: SubscriptionType,
    pub support_type: SupportType,
    pub release_price: u64,
    pub total_support_fee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    NoTableEntry,
    AmbiguousMapping,
    NoCounterpartGroup,
    NoStorageMatch,
    AmbiguousJoin,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnresolvedReason::NoTableEntry => "no_table_entry",
            UnresolvedReason::AmbiguousMapping => "ambiguous_mapping",
            UnresolvedReason::NoCounterpartGroup => "no_counterpart_group",
            UnresolvedReason::NoStorageMatch => "no_storage_match",
            UnresolvedReason::AmbiguousJoin => "ambiguous_join",
        };
        f.write_str(s)
    }
}

/// A record that could not be resolved or joined, surfaced for manual review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedGroup {
    pub reason: UnresolvedReason,
    pub record: CollectedRecord,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReconStats {
    pub support_in: usize,
    pub price_in: usize,
    pub offers: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconOutcome {
    pub offers: Vec<ReconciledOffer>,
    pub unresolved: Vec<UnresolvedGroup>,
    pub stats: ReconStats,
}

pub fn split_records(records: Vec<CollectedRecord>) -> (Vec<SupportRecord>, Vec<PriceRecord>) {
    let mut supports = Vec::new();
    let mut prices = Vec::new();
    for record in records {
        match record {
            CollectedRecord::Support(r) => supports.push(r),
            CollectedRecord::Price(r) => prices.push(r),
        }
    }
    (supports, prices)
}

type GroupKey = (Carrier, String);

/// Joins support records to price records through the resolution table.
///
/// Every input record lands in exactly one offer-side pairing or exactly one
/// unresolved entry; nothing is dropped silently. A single price record fans
/// out to all support records sharing its `(carrier, identity, storage)` key.
pub fn reconcile(
    supports: Vec<SupportRecord>,
    prices: Vec<PriceRecord>,
    table: &ResolutionTable,
) -> ReconOutcome {
    let support_in = supports.len();
    let price_in = prices.len();
    let mut offers = Vec::new();
    let mut unresolved = Vec::new();

    let mut support_groups: BTreeMap<GroupKey, BTreeMap<StorageTier, Vec<SupportRecord>>> =
        BTreeMap::new();
    for record in supports {
        match table.resolve(record.carrier, &record.raw_device_label) {
            Resolution::Resolved(identity) => {
                support_groups
                    .entry((record.carrier, identity.product_group))
                    .or_default()
                    .entry(identity.storage)
                    .or_default()
                    .push(record);
            }
            Resolution::Unknown => unresolved.push(UnresolvedGroup {
                reason: UnresolvedReason::NoTableEntry,
                record: CollectedRecord::Support(record),
            }),
            Resolution::Ambiguous => unresolved.push(UnresolvedGroup {
                reason: UnresolvedReason::AmbiguousMapping,
                record: CollectedRecord::Support(record),
            }),
        }
    }

    let mut price_groups: BTreeMap<GroupKey, BTreeMap<StorageTier, Vec<PriceRecord>>> =
        BTreeMap::new();
    for record in prices {
        match table.resolve(record.carrier, &record.raw_device_label) {
            Resolution::Resolved(identity) => {
                price_groups
                    .entry((record.carrier, identity.product_group))
                    .or_default()
                    .entry(identity.storage)
                    .or_default()
                    .push(record);
            }
            Resolution::Unknown => unresolved.push(UnresolvedGroup {
                reason: UnresolvedReason::NoTableEntry,
                record: CollectedRecord::Price(record),
            }),
            Resolution::Ambiguous => unresolved.push(UnresolvedGroup {
                reason: UnresolvedReason::AmbiguousMapping,
                record: CollectedRecord::Price(record),
            }),
        }
    }

    let mut used_prices = 0usize;

    for ((carrier, product_group), storages) in support_groups {
        let Some(mut price_storages) = price_groups.remove(&(carrier, product_group.clone()))
        else {
            for records in storages.into_values() {
                for record in records {
                    unresolved.push(UnresolvedGroup {
                        reason: UnresolvedReason::NoCounterpartGroup,
                        record: CollectedRecord::Support(record),
                    });
                }
            }
            continue;
        };

        for (storage, support_rows) in storages {
            let Some(mut price_rows) = price_storages.remove(&storage) else {
                for record in support_rows {
                    unresolved.push(UnresolvedGroup {
                        reason: UnresolvedReason::NoStorageMatch,
                        record: CollectedRecord::Support(record),
                    });
                }
                continue;
            };

            if price_rows.len() > 1 {
                // Two price rows for one SKU would produce duplicate offers
                // per key; report instead of picking one.
                for record in support_rows {
                    unresolved.push(UnresolvedGroup {
                        reason: UnresolvedReason::AmbiguousJoin,
                        record: CollectedRecord::Support(record),
                    });
                }
                for record in price_rows {
                    unresolved.push(UnresolvedGroup {
                        reason: UnresolvedReason::AmbiguousJoin,
                        record: CollectedRecord::Price(record),
                    });
                }
                continue;
            }
            let Some(price) = price_rows.pop() else {
                continue;
            };

            // A support key may appear once per (plan, subscription type);
            // collisions would collapse distinct rows into one offer tuple.
            let mut key_counts: HashMap<(&str, SubscriptionType), usize> = HashMap::new();
            for row in &support_rows {
                *key_counts
                    .entry((row.rate_plan.as_str(), row.subscription_type))
                    .or_default() += 1;
            }

            let mut emitted = 0usize;
            for row in &support_rows {
                let unique =
                    key_counts[&(row.rate_plan.as_str(), row.subscription_type)] == 1;
                if unique {
                    offers.push(ReconciledOffer {
                        identity: DeviceIdentity {
                            product_group: product_group.clone(),
                            storage,
                        },
                        carrier,
                        storage,
                        rate_plan: row.rate_plan.clone(),
                        monthly_fee: row.monthly_fee,
                        subscription_type: row.subscription_type,
                        support_type: row.support_type,
                        release_price: price.release_price,
                        total_support_fee: row.total_support_fee,
                    });
                    emitted += 1;
                } else {
                    unresolved.push(UnresolvedGroup {
                        reason: UnresolvedReason::AmbiguousJoin,
                        record: CollectedRecord::Support(row.clone()),
                    });
                }
            }
            if emitted > 0 {
                used_prices += 1;
            } else {
                unresolved.push(UnresolvedGroup {
                    reason: UnresolvedReason::AmbiguousJoin,
                    record: CollectedRecord::Price(price),
                });
            }
        }

        for records in price_storages.into_values() {
            for record in records {
                unresolved.push(UnresolvedGroup {
                    reason: UnresolvedReason::NoStorageMatch,
                    record: CollectedRecord::Price(record),
                });
            }
        }
    }

    for storages in price_groups.into_values() {
        for records in storages.into_values() {
            for record in records {
                unresolved.push(UnresolvedGroup {
                    reason: UnresolvedReason::NoCounterpartGroup,
                    record: CollectedRecord::Price(record),
                });
            }
        }
    }

    let support_unresolved = unresolved.iter().filter(|u| u.record.is_support()).count();
    let price_unresolved = unresolved.len() - support_unresolved;
    debug_assert_eq!(offers.len() + support_unresolved, support_in);
    debug_assert_eq!(used_prices + price_unresolved, price_in);

    let stats = ReconStats {
        support_in,
        price_in,
        offers: offers.len(),
        unresolved: unresolved.len(),
    };
    ReconOutcome {
        offers,
        unresolved,
        stats,
    }
}

// ---------------------------------------------------------------------------
// Rebate / Net-Price Calculator
// ---------------------------------------------------------------------------

pub const INSTALLMENT_MONTHS: u64 = 24;
pub const CONTRACT_DISCOUNT_PERCENT: u64 = 25;

/// One dealer rebate rule. Absent/empty filters match everything; matching
/// rules accumulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebateRule {
    pub description: String,
    pub carrier: Carrier,
    #[serde(default)]
    pub min_monthly_fee: Option<u64>,
    #[serde(default)]
    pub subscription_types: Vec<SubscriptionType>,
    #[serde(default)]
    pub support_type: Option<SupportType>,
    #[serde(default)]
    pub product_groups: Vec<String>,
    /// Won, added to the subsidy side of the net cost.
    pub amount: u64,
}

impl RebateRule {
    fn matches(&self, offer: &ReconciledOffer) -> bool {
        if self.carrier != offer.carrier {
            return false;
        }
        if let Some(min) = self.min_monthly_fee {
            if offer.monthly_fee < min {
                return false;
            }
        }
        if let Some(support_type) = self.support_type {
            if offer.support_type != support_type {
                return false;
            }
        }
        if !self.subscription_types.is_empty()
            && !self.subscription_types.contains(&offer.subscription_type)
        {
            return false;
        }
        if !self.product_groups.is_empty()
            && !self
                .product_groups
                .iter()
                .any(|group| group == &offer.identity.product_group)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebateBook {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<RebateRule>,
}

impl RebateBook {
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading rebate book {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing rebate book {}", path.display()))
    }

    pub fn rebate_for(&self, offer: &ReconciledOffer) -> u64 {
        self.rules
            .iter()
            .filter(|rule| rule.matches(offer))
            .map(|rule| rule.amount)
            .sum()
    }
}

/// Final effective price breakdown for one reconciled offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    pub rebate_amount: u64,
    pub net_device_cost: u64,
    pub effective_monthly_cost: u64,
    /// Subsidy plus rebate exceeded the release price; the net cost was
    /// clamped to zero and the offer flagged for review.
    pub clamped: bool,
}

/// Pure; no I/O, deterministic for identical input.
pub fn compute(offer: &ReconciledOffer, book: &RebateBook) -> PriceBreakdown {
    let rebate_amount = book.rebate_for(offer);
    let deductions = offer.total_support_fee.saturating_add(rebate_amount);
    let clamped = deductions > offer.release_price;
    if clamped {
        warn!(
            carrier = %offer.carrier,
            device = %offer.identity,
            release_price = offer.release_price,
            deductions,
            "net device cost clamped to zero"
        );
    }
    let net_device_cost = offer.release_price.saturating_sub(deductions);

    let discounted_fee = match offer.support_type {
        SupportType::ContractDiscount => {
            offer.monthly_fee * (100 - CONTRACT_DISCOUNT_PERCENT) / 100
        }
        SupportType::PublicSubsidy => offer.monthly_fee,
    };
    PriceBreakdown {
        rebate_amount,
        net_device_cost,
        effective_monthly_cost: discounted_fee + net_device_cost / INSTALLMENT_MONTHS,
        clamped,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputedOffer {
    #[serde(flatten)]
    pub offer: ReconciledOffer,
    #[serde(flatten)]
    pub breakdown: PriceBreakdown,
}

pub fn price_all(offers: &[ReconciledOffer], book: &RebateBook) -> Vec<ComputedOffer> {
    offers
        .iter()
        .map(|offer| ComputedOffer {
            offer: offer.clone(),
            breakdown: compute(offer, book),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Run reports & export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReconRunSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub offers: usize,
    pub unresolved: usize,
    pub clamped: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes the review artifacts for one reconciliation run: a markdown brief,
/// a JSON delta, and flat parquet snapshots of offers and unresolved records.
pub async fn write_run_report(
    reports_root: &Path,
    run_id: Uuid,
    outcome: &ReconOutcome,
    computed: &[ComputedOffer],
) -> Result<ReconRunSummary> {
    let generated_at = Utc::now();
    let reports_dir = reports_root.join(run_id.to_string());
    tokio::fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let clamped = computed.iter().filter(|c| c.breakdown.clamped).count();

    let mut reason_counts: BTreeMap<String, usize> = BTreeMap::new();
    for item in &outcome.unresolved {
        *reason_counts.entry(item.reason.to_string()).or_default() += 1;
    }
    let brief = format!(
        "# Reconciliation Brief\n\n- Run ID: `{}`\n- Generated: {}\n- Support records in: {}\n- Price records in: {}\n- Reconciled offers: {}\n- Unresolved records: {}\n- Clamped net costs: {}\n\n## Unresolved by reason\n{}\n",
        run_id,
        generated_at,
        outcome.stats.support_in,
        outcome.stats.price_in,
        outcome.stats.offers,
        outcome.stats.unresolved,
        clamped,
        reason_counts
            .iter()
            .map(|(reason, count)| format!("- {reason}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    tokio::fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;

    let delta = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": run_id,
        "generated_at": generated_at,
        "stats": outcome.stats,
        "offers": computed,
        "unresolved": outcome.unresolved,
    }))
    .context("serializing offers delta")?;
    tokio::fs::write(reports_dir.join("offers_delta.json"), delta)
        .await
        .context("writing offers_delta.json")?;

    let snapshot_dir = reports_dir.join("snapshots");
    tokio::fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let offers_path = snapshot_dir.join("offers.parquet");
    let unresolved_path = snapshot_dir.join("unresolved.parquet");
    write_offers_parquet(&offers_path, computed)?;
    write_unresolved_parquet(&unresolved_path, &outcome.unresolved)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("offers", &reports_dir, &offers_path)?,
            manifest_entry("unresolved", &reports_dir, &unresolved_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    tokio::fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ReconRunSummary {
        run_id,
        generated_at,
        offers: outcome.stats.offers,
        unresolved: outcome.stats.unresolved,
        clamped,
        reports_dir: reports_dir.display().to_string(),
        parquet_manifest: manifest_path.display().to_string(),
    })
}

/// Markdown digest of the most recent reconciliation runs.
pub fn report_recent(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Reconciliation Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join("offers_delta.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let offers = delta
            .get("stats")
            .and_then(|s| s.get("offers"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let unresolved = delta
            .get("stats")
            .and_then(|s| s.get("unresolved"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- offers: {offers}"));
        lines.push(format!("- unresolved: {unresolved}"));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_offers_parquet(path: &Path, computed: &[ComputedOffer]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("carrier", DataType::Utf8, false),
        ArrowField::new("product_group", DataType::Utf8, false),
        ArrowField::new("storage", DataType::Utf8, false),
        ArrowField::new("rate_plan", DataType::Utf8, false),
        ArrowField::new("monthly_fee", DataType::UInt64, false),
        ArrowField::new("subscription_type", DataType::Utf8, false),
        ArrowField::new("support_type", DataType::Utf8, false),
        ArrowField::new("release_price", DataType::UInt64, false),
        ArrowField::new("total_support_fee", DataType::UInt64, false),
        ArrowField::new("rebate_amount", DataType::UInt64, false),
        ArrowField::new("net_device_cost", DataType::UInt64, false),
        ArrowField::new("effective_monthly_cost", DataType::UInt64, false),
        ArrowField::new("clamped", DataType::Boolean, false),
    ]));

    let carriers = StringArray::from(
        computed
            .iter()
            .map(|c| c.offer.carrier.code())
            .collect::<Vec<_>>(),
    );
    let product_groups = StringArray::from(
        computed
            .iter()
            .map(|c| c.offer.identity.product_group.as_str())
            .collect::<Vec<_>>(),
    );
    let storages =
        StringArray::from_iter_values(computed.iter().map(|c| c.offer.storage.to_string()));
    let rate_plans = StringArray::from(
        computed
            .iter()
            .map(|c| c.offer.rate_plan.as_str())
            .collect::<Vec<_>>(),
    );
    let monthly_fees =
        UInt64Array::from(computed.iter().map(|c| c.offer.monthly_fee).collect::<Vec<_>>());
    let subscription_types = StringArray::from_iter_values(
        computed.iter().map(|c| c.offer.subscription_type.to_string()),
    );
    let support_types =
        StringArray::from_iter_values(computed.iter().map(|c| c.offer.support_type.to_string()));
    let release_prices =
        UInt64Array::from(computed.iter().map(|c| c.offer.release_price).collect::<Vec<_>>());
    let support_fees = UInt64Array::from(
        computed
            .iter()
            .map(|c| c.offer.total_support_fee)
            .collect::<Vec<_>>(),
    );
    let rebates = UInt64Array::from(
        computed
            .iter()
            .map(|c| c.breakdown.rebate_amount)
            .collect::<Vec<_>>(),
    );
    let net_costs = UInt64Array::from(
        computed
            .iter()
            .map(|c| c.breakdown.net_device_cost)
            .collect::<Vec<_>>(),
    );
    let monthly_costs = UInt64Array::from(
        computed
            .iter()
            .map(|c| c.breakdown.effective_monthly_cost)
            .collect::<Vec<_>>(),
    );
    let clamped =
        BooleanArray::from(computed.iter().map(|c| c.breakdown.clamped).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(carriers),
            Arc::new(product_groups),
            Arc::new(storages),
            Arc::new(rate_plans),
            Arc::new(monthly_fees),
            Arc::new(subscription_types),
            Arc::new(support_types),
            Arc::new(release_prices),
            Arc::new(support_fees),
            Arc::new(rebates),
            Arc::new(net_costs),
            Arc::new(monthly_costs),
            Arc::new(clamped),
        ],
    )
    .context("building offers record batch")?;
    write_parquet(path, batch)
}

fn write_unresolved_parquet(path: &Path, unresolved: &[UnresolvedGroup]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("reason", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("carrier", DataType::Utf8, false),
        ArrowField::new("raw_device_label", DataType::Utf8, false),
        ArrowField::new("storage_raw", DataType::Utf8, false),
    ]));

    let reasons = StringArray::from_iter_values(unresolved.iter().map(|u| u.reason.to_string()));
    let kinds = StringArray::from(
        unresolved
            .iter()
            .map(|u| if u.record.is_support() { "support" } else { "price" })
            .collect::<Vec<_>>(),
    );
    let carriers = StringArray::from(
        unresolved
            .iter()
            .map(|u| u.record.carrier().code())
            .collect::<Vec<_>>(),
    );
    let labels = StringArray::from(
        unresolved
            .iter()
            .map(|u| u.record.raw_device_label())
            .collect::<Vec<_>>(),
    );
    let storage_raws = StringArray::from(
        unresolved
            .iter()
            .map(|u| match &u.record {
                CollectedRecord::Support(r) => r.storage_raw.as_str(),
                CollectedRecord::Price(r) => r.storage_raw.as_str(),
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(reasons),
            Arc::new(kinds),
            Arc::new(carriers),
            Arc::new(labels),
            Arc::new(storage_raws),
        ],
    )
    .context("building unresolved record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(carrier: Carrier, raw: &str, group: &str, storage: StorageTier) -> ResolutionRow {
        ResolutionRow {
            carrier,
            raw_label: raw.to_string(),
            product_group: group.to_string(),
            storage,
        }
    }

    fn support(
        carrier: Carrier,
        label: &str,
        storage_raw: &str,
        plan: &str,
        fee: u64,
        sub: SubscriptionType,
        total: u64,
    ) -> SupportRecord {
        SupportRecord {
            carrier,
            raw_device_label: label.to_string(),
            storage_raw: storage_raw.to_string(),
            rate_plan: plan.to_string(),
            monthly_fee: fee,
            subscription_type: sub,
            support_type: SupportType::PublicSubsidy,
            total_support_fee: total,
            collected_at: Utc::now(),
        }
    }

    fn price(carrier: Carrier, label: &str, storage_raw: &str, release: u64) -> PriceRecord {
        PriceRecord {
            carrier,
            raw_device_label: label.to_string(),
            storage_raw: storage_raw.to_string(),
            release_price: release,
            collected_at: Utc::now(),
        }
    }

    fn flip7_table() -> ResolutionTable {
        ResolutionTable::from_rows(vec![row(
            Carrier::Kt,
            "플립7",
            "갤럭시 Z 플립 7",
            StorageTier::Gigabytes(256),
        )])
    }

    #[test]
    fn resolution_is_deterministic() {
        let table = flip7_table();
        let first = table.resolve(Carrier::Kt, "플립7");
        let second = table.resolve(Carrier::Kt, "플립7");
        assert_eq!(first, second);
        assert!(matches!(first, Resolution::Resolved(_)));
    }

    #[test]
    fn lookup_trims_but_preserves_internal_spacing() {
        let table = ResolutionTable::from_rows(vec![
            row(Carrier::Skt, "플립 7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(512)),
        ]);
        assert!(matches!(
            table.resolve(Carrier::Skt, "  플립 7  "),
            Resolution::Resolved(_)
        ));
        // Internal spacing distinguishes labels; "플립7" is a different key.
        assert_eq!(table.resolve(Carrier::Skt, "플립7"), Resolution::Unknown);
    }

    #[test]
    fn conflicting_rows_fail_closed() {
        let table = ResolutionTable::from_rows(vec![
            row(Carrier::Kt, "플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
            row(Carrier::Kt, "플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(512)),
        ]);
        assert_eq!(table.resolve(Carrier::Kt, "플립7"), Resolution::Ambiguous);
    }

    #[test]
    fn duplicate_identical_rows_collapse() {
        let table = ResolutionTable::from_rows(vec![
            row(Carrier::Kt, "플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
            row(Carrier::Kt, "플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
        ]);
        assert!(matches!(
            table.resolve(Carrier::Kt, "플립7"),
            Resolution::Resolved(_)
        ));
    }

    #[test]
    fn insert_replaces_and_bumps_version() {
        let mut table = flip7_table();
        let before = table.version();
        table.insert(row(
            Carrier::Kt,
            "플립7",
            "갤럭시 Z 플립 7",
            StorageTier::Gigabytes(512),
        ));
        assert_eq!(table.len(), 1);
        assert!(table.version() > before);
        match table.resolve(Carrier::Kt, "플립7") {
            Resolution::Resolved(identity) => {
                assert_eq!(identity.storage, StorageTier::Gigabytes(512));
            }
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[test]
    fn update_storage_requires_existing_key() {
        let mut table = flip7_table();
        table
            .update_storage(Carrier::Kt, "플립7", StorageTier::Gigabytes(512))
            .expect("existing key");
        assert!(table
            .update_storage(Carrier::Kt, "폴드7", StorageTier::Gigabytes(512))
            .is_err());
    }

    #[test]
    fn entries_for_group_lists_all_spellings() {
        let table = ResolutionTable::from_rows(vec![
            row(Carrier::Kt, "플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
            row(Carrier::Kt, "Z플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
            row(Carrier::Kt, "폴드7", "갤럭시 Z 폴드 7", StorageTier::Gigabytes(512)),
        ]);
        assert_eq!(table.entries_for_group("갤럭시 Z 플립 7").len(), 2);
    }

    #[tokio::test]
    async fn table_save_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("resolution_table.yaml");
        let table = flip7_table();
        table.save(&path).await.expect("save");

        let loaded = ResolutionTable::load(&path).await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.version(), table.version());
        assert_eq!(
            loaded.resolve(Carrier::Kt, "플립7"),
            table.resolve(Carrier::Kt, "플립7")
        );
    }

    #[test]
    fn scenario_flip7_reconciles_into_one_offer() {
        let table = flip7_table();
        let supports = vec![support(
            Carrier::Kt,
            "플립7",
            "256GB",
            "초이스 베이직",
            110_000,
            SubscriptionType::NumberTransfer,
            500_000,
        )];
        let prices = vec![price(Carrier::Kt, "플립7", "256GB", 1_980_000)];

        let outcome = reconcile(supports, prices, &table);
        assert_eq!(outcome.offers.len(), 1);
        assert!(outcome.unresolved.is_empty());
        let offer = &outcome.offers[0];
        assert_eq!(offer.release_price, 1_980_000);
        let breakdown = compute(offer, &RebateBook::empty());
        assert_eq!(breakdown.net_device_cost, 1_980_000 - 500_000);
    }

    #[test]
    fn same_label_different_carrier_storage_never_cross_joins() {
        // Both carriers print "플립 7" but mean different storage SKUs.
        let table = ResolutionTable::from_rows(vec![
            row(Carrier::Skt, "플립 7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(512)),
            row(Carrier::Kt, "플립 7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
        ]);
        let supports = vec![support(
            Carrier::Skt,
            "플립 7",
            "512GB",
            "5GX 프라임",
            89_000,
            SubscriptionType::NewSignup,
            400_000,
        )];
        let prices = vec![
            price(Carrier::Skt, "플립 7", "512GB", 2_100_000),
            price(Carrier::Kt, "플립 7", "256GB", 1_980_000),
        ];

        let outcome = reconcile(supports, prices, &table);
        assert_eq!(outcome.offers.len(), 1);
        assert_eq!(outcome.offers[0].carrier, Carrier::Skt);
        assert_eq!(outcome.offers[0].release_price, 2_100_000);
        // The KT-side price has no KT support rows and is surfaced.
        assert_eq!(outcome.unresolved.len(), 1);
        assert_eq!(
            outcome.unresolved[0].reason,
            UnresolvedReason::NoCounterpartGroup
        );
    }

    #[test]
    fn unmapped_label_is_surfaced_not_joined() {
        let table = flip7_table();
        let supports = vec![support(
            Carrier::Kt,
            "이름없는폰",
            "128GB",
            "요고 30",
            30_000,
            SubscriptionType::DeviceChange,
            100_000,
        )];
        let outcome = reconcile(supports, Vec::new(), &table);
        assert!(outcome.offers.is_empty());
        assert_eq!(outcome.unresolved.len(), 1);
        assert_eq!(outcome.unresolved[0].reason, UnresolvedReason::NoTableEntry);
    }

    #[test]
    fn price_fans_out_to_all_matching_supports() {
        let table = flip7_table();
        let supports = vec![
            support(
                Carrier::Kt,
                "플립7",
                "256GB",
                "초이스 베이직",
                110_000,
                SubscriptionType::NumberTransfer,
                500_000,
            ),
            support(
                Carrier::Kt,
                "플립7",
                "256GB",
                "초이스 스페셜",
                130_000,
                SubscriptionType::NumberTransfer,
                570_000,
            ),
            support(
                Carrier::Kt,
                "플립7",
                "256GB",
                "초이스 베이직",
                110_000,
                SubscriptionType::DeviceChange,
                450_000,
            ),
        ];
        let prices = vec![price(Carrier::Kt, "플립7", "256GB", 1_980_000)];

        let outcome = reconcile(supports, prices, &table);
        assert_eq!(outcome.offers.len(), 3);
        assert!(outcome
            .offers
            .iter()
            .all(|offer| offer.release_price == 1_980_000));
    }

    #[test]
    fn duplicate_support_keys_are_reported_not_collapsed() {
        let table = flip7_table();
        let supports = vec![
            support(
                Carrier::Kt,
                "플립7",
                "256GB",
                "초이스 베이직",
                110_000,
                SubscriptionType::NumberTransfer,
                500_000,
            ),
            support(
                Carrier::Kt,
                "플립7",
                "256GB",
                "초이스 베이직",
                110_000,
                SubscriptionType::NumberTransfer,
                520_000,
            ),
        ];
        let prices = vec![price(Carrier::Kt, "플립7", "256GB", 1_980_000)];

        let outcome = reconcile(supports, prices, &table);
        assert!(outcome.offers.is_empty());
        assert_eq!(outcome.unresolved.len(), 3);
        assert!(outcome
            .unresolved
            .iter()
            .all(|u| u.reason == UnresolvedReason::AmbiguousJoin));
    }

    #[test]
    fn every_input_record_is_accounted_for() {
        let table = ResolutionTable::from_rows(vec![
            row(Carrier::Kt, "플립7", "갤럭시 Z 플립 7", StorageTier::Gigabytes(256)),
            row(Carrier::Skt, "S25", "갤럭시 S25", StorageTier::Gigabytes(256)),
            row(Carrier::Kt, "깡통폰", "깡통폰", StorageTier::Gigabytes(128)),
        ]);
        let supports = vec![
            support(
                Carrier::Kt,
                "플립7",
                "256GB",
                "초이스 베이직",
                110_000,
                SubscriptionType::NumberTransfer,
                500_000,
            ),
            // Resolves, but no price side at all for this group.
            support(
                Carrier::Kt,
                "깡통폰",
                "128GB",
                "요고 30",
                30_000,
                SubscriptionType::NewSignup,
                50_000,
            ),
            // No table entry.
            support(
                Carrier::LgUplus,
                "미확인폰",
                "128GB",
                "5G 라이트",
                55_000,
                SubscriptionType::NewSignup,
                150_000,
            ),
        ];
        let prices = vec![
            price(Carrier::Kt, "플립7", "256GB", 1_980_000),
            price(Carrier::Skt, "S25", "256GB", 1_155_000),
        ];

        let outcome = reconcile(supports.clone(), prices.clone(), &table);
        let support_unresolved = outcome
            .unresolved
            .iter()
            .filter(|u| u.record.is_support())
            .count();
        let price_unresolved = outcome.unresolved.len() - support_unresolved;
        assert_eq!(outcome.offers.len() + support_unresolved, supports.len());
        // Each price is either joined into offers or surfaced exactly once.
        assert_eq!(price_unresolved + 1, prices.len());
        assert_eq!(outcome.stats.support_in, supports.len());
        assert_eq!(outcome.stats.price_in, prices.len());
    }

    fn sample_offer() -> ReconciledOffer {
        ReconciledOffer {
            identity: DeviceIdentity {
                product_group: "갤럭시 S25".to_string(),
                storage: StorageTier::Gigabytes(256),
            },
            carrier: Carrier::Skt,
            storage: StorageTier::Gigabytes(256),
            rate_plan: "5GX 프라임".to_string(),
            monthly_fee: 89_000,
            subscription_type: SubscriptionType::NumberTransfer,
            support_type: SupportType::PublicSubsidy,
            release_price: 1_155_000,
            total_support_fee: 500_000,
        }
    }

    #[test]
    fn rebate_rules_accumulate_when_matching() {
        let book = RebateBook {
            version: 1,
            rules: vec![
                RebateRule {
                    description: "S25 계열".to_string(),
                    carrier: Carrier::Skt,
                    min_monthly_fee: Some(79_000),
                    subscription_types: vec![SubscriptionType::NumberTransfer],
                    support_type: None,
                    product_groups: vec!["갤럭시 S25".to_string()],
                    amount: 70_000,
                },
                RebateRule {
                    description: "전 모델 공통".to_string(),
                    carrier: Carrier::Skt,
                    min_monthly_fee: None,
                    subscription_types: vec![],
                    support_type: None,
                    product_groups: vec![],
                    amount: 30_000,
                },
                RebateRule {
                    description: "KT 전용".to_string(),
                    carrier: Carrier::Kt,
                    min_monthly_fee: None,
                    subscription_types: vec![],
                    support_type: None,
                    product_groups: vec![],
                    amount: 999_999,
                },
            ],
        };
        let offer = sample_offer();
        let breakdown = compute(&offer, &book);
        assert_eq!(breakdown.rebate_amount, 100_000);
        assert_eq!(
            breakdown.net_device_cost,
            1_155_000 - 500_000 - 100_000
        );
        assert!(!breakdown.clamped);
    }

    #[test]
    fn net_cost_clamps_at_zero_and_flags() {
        let mut offer = sample_offer();
        offer.release_price = 400_000;
        let book = RebateBook {
            version: 1,
            rules: vec![RebateRule {
                description: "과다 리베이트".to_string(),
                carrier: Carrier::Skt,
                min_monthly_fee: None,
                subscription_types: vec![],
                support_type: None,
                product_groups: vec![],
                amount: 200_000,
            }],
        };
        let breakdown = compute(&offer, &book);
        assert_eq!(breakdown.net_device_cost, 0);
        assert!(breakdown.clamped);
    }

    #[test]
    fn contract_discount_reduces_effective_monthly_fee() {
        let mut offer = sample_offer();
        offer.support_type = SupportType::ContractDiscount;
        offer.monthly_fee = 100_000;
        offer.release_price = 1_000_000;
        offer.total_support_fee = 280_000;
        let breakdown = compute(&offer, &RebateBook::empty());
        assert_eq!(
            breakdown.effective_monthly_cost,
            75_000 + 720_000 / INSTALLMENT_MONTHS
        );
    }

    #[test]
    fn compute_is_deterministic() {
        let offer = sample_offer();
        let book = RebateBook::empty();
        assert_eq!(compute(&offer, &book), compute(&offer, &book));
    }

    #[tokio::test]
    async fn run_report_writes_brief_delta_and_snapshots() {
        let dir = tempdir().expect("tempdir");
        let table = flip7_table();
        let supports = vec![support(
            Carrier::Kt,
            "플립7",
            "256GB",
            "초이스 베이직",
            110_000,
            SubscriptionType::NumberTransfer,
            500_000,
        )];
        let prices = vec![price(Carrier::Kt, "플립7", "256GB", 1_980_000)];
        let outcome = reconcile(supports, prices, &table);
        let computed = price_all(&outcome.offers, &RebateBook::empty());

        let run_id = Uuid::new_v4();
        let summary = write_run_report(dir.path(), run_id, &outcome, &computed)
            .await
            .expect("report");
        assert_eq!(summary.offers, 1);
        assert_eq!(summary.clamped, 0);

        let run_dir = dir.path().join(run_id.to_string());
        assert!(run_dir.join("brief.md").exists());
        assert!(run_dir.join("offers_delta.json").exists());
        assert!(run_dir.join("snapshots").join("offers.parquet").exists());
        assert!(run_dir.join("snapshots").join("manifest.json").exists());

        let digest = report_recent(dir.path(), 3).expect("digest");
        assert!(digest.contains(&run_id.to_string()));
    }
}
