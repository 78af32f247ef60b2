//! Collection normalizer
//!
//! Turns raw collection documents (one `<quantity> <item name>` line per
//! item) into [`QuantityEvent`]s keyed by a derived collection id.
//!
//! Line grammar:
//! - leading/trailing whitespace is ignored
//! - blank lines and lines starting with `#` or `//` are skipped, never counted
//! - the first whitespace-separated token must be a positive integer that
//!   fits in `u32`; the rest of the line (whitespace-collapsed) is the name
//!
//! A bad line is rejected with [`NormalizationError::MalformedLine`] and
//! logged; it never aborts the rest of the document.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};
use types::errors::{MalformedReason, NormalizationError};
use types::events::QuantityEvent;
use types::ids::{CollectionId, ItemIdentity};
use types::numeric::Quantity;

/// One accepted item line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub quantity: Quantity,
    /// Display name with internal whitespace collapsed.
    pub name: String,
}

/// Parse a single raw line.
///
/// Returns `Ok(None)` for blank and comment lines.
pub fn parse_line(raw: &str) -> Result<Option<ParsedLine>, NormalizationError> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return Ok(None);
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let token = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    let quantity = parse_quantity(token)?;
    let name = rest.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(NormalizationError::malformed(MalformedReason::EmptyName));
    }

    Ok(Some(ParsedLine { quantity, name }))
}

fn parse_quantity(token: &str) -> Result<Quantity, NormalizationError> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, token),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NormalizationError::malformed(MalformedReason::MissingQuantity));
    }
    if negative || digits.bytes().all(|b| b == b'0') {
        return Err(NormalizationError::malformed(MalformedReason::NonPositiveQuantity));
    }
    digits
        .parse::<u32>()
        .ok()
        .and_then(Quantity::new)
        .ok_or(NormalizationError::malformed(MalformedReason::QuantityOverflow))
}

/// Derive a display name from a source path the way deck files are named:
/// strip `.deck`/`.txt`, hyphens and underscores become spaces, each word
/// gets an upper-case initial.
///
/// `decks/mono-red_aggro.deck` → `Mono Red Aggro`
pub fn collection_name_from_source(source: &str) -> String {
    let base = Path::new(source)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string());
    let stem = base.strip_suffix(".deck").unwrap_or(&base);
    let stem = stem.strip_suffix(".txt").unwrap_or(stem);

    stem.replace(['-', '_'], " ")
        .split(' ')
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Stateless per-collection normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer {
    collection_id: CollectionId,
    collection_name: String,
    event_time: i64,
}

impl Normalizer {
    /// `source` is the collection's stable identity (its path or name).
    pub fn new(source: &str, collection_name: impl Into<String>, event_time: i64) -> Self {
        Self {
            collection_id: CollectionId::from_source(source),
            collection_name: collection_name.into(),
            event_time,
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    /// Normalize one raw record. `Ok(None)` means the line carries no item.
    pub fn normalize(&self, raw: &str) -> Result<Option<QuantityEvent>, NormalizationError> {
        Ok(parse_line(raw)?.map(|line| {
            QuantityEvent::new(
                self.collection_id,
                self.collection_name.clone(),
                line.name,
                line.quantity,
                self.event_time,
            )
        }))
    }
}

/// A rejected source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    /// 1-based line number.
    pub line_no: usize,
    pub error: NormalizationError,
}

/// Totals over the accepted lines of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionSummary {
    pub total_items: u64,
    pub unique_items: u64,
}

/// Result of normalizing a whole collection document.
#[derive(Debug, Clone)]
pub struct NormalizedCollection {
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub source: String,
    /// One event per distinct item identity, in first-seen order.
    pub events: Vec<QuantityEvent>,
    pub rejected: Vec<RejectedLine>,
    pub summary: CollectionSummary,
}

/// Normalize every line of `text`.
///
/// Lines whose names map to the same identity are merged into one event
/// with the summed quantity. A merge that would overflow `u32` rejects the
/// later line.
pub fn normalize_collection(source: &str, text: &str, event_time: i64) -> NormalizedCollection {
    let collection_name = collection_name_from_source(source);
    let normalizer = Normalizer::new(source, collection_name.clone(), event_time);

    let mut merged: Vec<(ItemIdentity, ParsedLine)> = Vec::new();
    let mut index: BTreeMap<ItemIdentity, usize> = BTreeMap::new();
    let mut rejected = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let parsed = match parse_line(raw) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(error) => {
                warn!(source, line_no, error = %error, "skipping malformed line");
                rejected.push(RejectedLine { line_no, error });
                continue;
            }
        };

        let identity = ItemIdentity::from_name(&parsed.name);
        match index.get(&identity) {
            Some(&pos) => {
                let existing = &mut merged[pos].1;
                match existing.quantity.checked_add(parsed.quantity) {
                    Some(sum) => {
                        warn!(
                            source,
                            line_no,
                            item = %identity,
                            first = %existing.name,
                            duplicate = %parsed.name,
                            "merging duplicate item line"
                        );
                        existing.quantity = sum;
                    }
                    None => {
                        let error = NormalizationError::malformed(MalformedReason::QuantityOverflow);
                        warn!(source, line_no, error = %error, "skipping malformed line");
                        rejected.push(RejectedLine { line_no, error });
                    }
                }
            }
            None => {
                index.insert(identity.clone(), merged.len());
                merged.push((identity, parsed));
            }
        }
    }

    let events: Vec<QuantityEvent> = merged
        .into_iter()
        .map(|(_, line)| {
            QuantityEvent::new(
                normalizer.collection_id(),
                collection_name.clone(),
                line.name,
                line.quantity,
                event_time,
            )
        })
        .collect();

    let summary = CollectionSummary {
        total_items: events.iter().map(|e| u64::from(e.quantity.get())).sum(),
        unique_items: events.len() as u64,
    };

    debug!(
        source,
        collection_id = %normalizer.collection_id(),
        events = events.len(),
        rejected = rejected.len(),
        total_items = summary.total_items,
        "normalized collection"
    );

    NormalizedCollection {
        collection_id: normalizer.collection_id(),
        collection_name,
        source: source.to_string(),
        events,
        rejected,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed(reason: MalformedReason) -> NormalizationError {
        NormalizationError::malformed(reason)
    }

    #[test]
    fn test_parse_line_accepts_quantity_and_name() {
        let parsed = parse_line("  4   Lightning   Bolt ").unwrap().unwrap();
        assert_eq!(parsed.quantity.get(), 4);
        assert_eq!(parsed.name, "Lightning Bolt");
    }

    #[test]
    fn test_parse_line_skips_blank_and_comments() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   \t"), Ok(None));
        assert_eq!(parse_line("# Sideboard"), Ok(None));
        assert_eq!(parse_line("// 4 Lightning Bolt"), Ok(None));
    }

    #[test]
    fn test_parse_line_rejections() {
        assert_eq!(parse_line("Lightning Bolt"), Err(malformed(MalformedReason::MissingQuantity)));
        assert_eq!(parse_line("4x Bolt"), Err(malformed(MalformedReason::MissingQuantity)));
        assert_eq!(parse_line("0 Bolt"), Err(malformed(MalformedReason::NonPositiveQuantity)));
        assert_eq!(parse_line("-2 Bolt"), Err(malformed(MalformedReason::NonPositiveQuantity)));
        assert_eq!(parse_line("4"), Err(malformed(MalformedReason::EmptyName)));
        assert_eq!(
            parse_line("99999999999 Bolt"),
            Err(malformed(MalformedReason::QuantityOverflow))
        );
    }

    #[test]
    fn test_collection_name_from_source() {
        assert_eq!(collection_name_from_source("decks/mono-red_aggro.deck"), "Mono Red Aggro");
        assert_eq!(collection_name_from_source("alpha.txt"), "Alpha");
        assert_eq!(collection_name_from_source("Jund"), "Jund");
    }

    #[test]
    fn test_normalizer_assigns_deterministic_ids() {
        let a = Normalizer::new("decks/alpha.deck", "Alpha", 1_000);
        let b = Normalizer::new("decks/alpha.deck", "Alpha", 1_000);
        let ea = a.normalize("4 Lightning Bolt").unwrap().unwrap();
        let eb = b.normalize("4 Lightning Bolt").unwrap().unwrap();
        assert_eq!(ea.collection_id, eb.collection_id);
        assert_eq!(ea.event_id, eb.event_id);
        assert_eq!(ea.item_identity.as_str(), "lightning bolt");
        assert_eq!(ea.item_name, "Lightning Bolt");
    }

    #[test]
    fn test_normalize_collection_skips_bad_lines_and_summarizes() {
        let text = "// Alpha\n4 Lightning Bolt\n\nnot a line\n1 Black Lotus\n0 Island\n";
        let collection = normalize_collection("decks/alpha.deck", text, 1_000);

        assert_eq!(collection.collection_name, "Alpha");
        assert_eq!(collection.events.len(), 2);
        assert_eq!(collection.summary.total_items, 5);
        assert_eq!(collection.summary.unique_items, 2);
        let rejected: Vec<usize> = collection.rejected.iter().map(|r| r.line_no).collect();
        assert_eq!(rejected, vec![4, 6]);
    }

    #[test]
    fn test_normalize_collection_merges_same_identity() {
        let text = "4 Lightning Bolt\n2 lightning  BOLT\n1 Black Lotus";
        let collection = normalize_collection("decks/alpha.deck", text, 1_000);

        assert_eq!(collection.events.len(), 2);
        let bolt = &collection.events[0];
        assert_eq!(bolt.item_identity.as_str(), "lightning bolt");
        assert_eq!(bolt.quantity.get(), 6);
        assert_eq!(bolt.item_name, "Lightning Bolt");
        assert_eq!(collection.summary.total_items, 7);
    }

    #[test]
    fn test_merge_overflow_rejects_later_line() {
        let text = format!("{} Bolt\n1 bolt", u32::MAX);
        let collection = normalize_collection("big.deck", &text, 0);
        assert_eq!(collection.events.len(), 1);
        assert_eq!(collection.events[0].quantity.get(), u32::MAX);
        assert_eq!(collection.rejected.len(), 1);
        assert_eq!(collection.rejected[0].line_no, 2);
    }
}
