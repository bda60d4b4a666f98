//! Fuzzy address grouping.
//!
//! Grouping is a greedy single pass: each record is compared against the
//! representative (first member) of every group opened so far and joins the
//! first one that scores at or above the threshold. The outcome depends on
//! input order.

use std::fmt;

use reag_core::{normalize, AddressFields, CanonicalProperty, ConfigurationError, NormalizedAddress, Provenance, RawRecord};
use strsim::levenshtein;

/// Similarity cut-off in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Threshold(u8);

impl Threshold {
    pub const FUZZY_DEFAULT: Threshold = Threshold(95);
    pub const STRICT_DEFAULT: Threshold = Threshold(98);

    pub fn new(value: u8) -> Result<Self, ConfigurationError> {
        if value > 100 {
            return Err(ConfigurationError::ThresholdOutOfRange(u16::from(value)));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::FUZZY_DEFAULT
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fuzzy and strict thresholds used together by one ETL run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupThresholds {
    pub fuzzy: Threshold,
    pub strict: Threshold,
}

impl DedupThresholds {
    pub fn new(fuzzy: u8, strict: u8) -> Result<Self, ConfigurationError> {
        let fuzzy = Threshold::new(fuzzy)?;
        let strict = Threshold::new(strict)?;
        if strict < fuzzy {
            return Err(ConfigurationError::ThresholdOrder {
                strict: strict.value(),
                fuzzy: fuzzy.value(),
            });
        }
        Ok(Self { fuzzy, strict })
    }
}

impl Default for DedupThresholds {
    fn default() -> Self {
        Self {
            fuzzy: Threshold::FUZZY_DEFAULT,
            strict: Threshold::STRICT_DEFAULT,
        }
    }
}

/// Symmetric similarity in `0..=100`; `100` for identical inputs.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &NormalizedAddress, b: &NormalizedAddress) -> u8;
}

/// Levenshtein ratio over the comparison keys with tokens sorted first, so
/// word order does not matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSortRatio;

impl SimilarityScorer for TokenSortRatio {
    fn score(&self, a: &NormalizedAddress, b: &NormalizedAddress) -> u8 {
        ratio(&sorted_tokens(&a.comparison_key()), &sorted_tokens(&b.comparison_key()))
    }
}

/// Plain Levenshtein ratio over the comparison keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinRatio;

impl SimilarityScorer for LevenshteinRatio {
    fn score(&self, a: &NormalizedAddress, b: &NormalizedAddress) -> u8 {
        ratio(&a.comparison_key(), &b.comparison_key())
    }
}

fn sorted_tokens(key: &str) -> String {
    let mut tokens = key.split_whitespace().collect::<Vec<_>>();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// `100 * (max_len - distance) / max_len`, rounded down. Two empty strings are
/// identical.
fn ratio(a: &str, b: &str) -> u8 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 100;
    }
    let distance = levenshtein(a, b).min(max_len);
    ((max_len - distance) * 100 / max_len) as u8
}

/// Records judged to be the same property, borrowed from the input slice.
#[derive(Debug)]
pub struct SimilarityGroup<'a, T> {
    pub members: Vec<&'a T>,
    /// Position of each member in the input.
    pub indices: Vec<usize>,
}

impl<'a, T> SimilarityGroup<'a, T> {
    fn open(index: usize, record: &'a T) -> Self {
        Self {
            members: vec![record],
            indices: vec![index],
        }
    }

    pub fn representative(&self) -> &'a T {
        self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<T> Clone for SimilarityGroup<'_, T> {
    fn clone(&self) -> Self {
        Self {
            members: self.members.clone(),
            indices: self.indices.clone(),
        }
    }
}

pub struct DedupEngine {
    threshold: Threshold,
    scorer: Box<dyn SimilarityScorer>,
}

impl DedupEngine {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            threshold,
            scorer: Box::new(TokenSortRatio),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn score(&self, a: &NormalizedAddress, b: &NormalizedAddress) -> u8 {
        self.scorer.score(a, b)
    }

    /// Partition `records` into similarity groups, in order of first
    /// occurrence. A record without an address is grouped as an empty address.
    pub fn group<'a, T, F>(&self, records: &'a [T], address_of: F) -> Vec<SimilarityGroup<'a, T>>
    where
        F: Fn(&T) -> Option<&AddressFields>,
    {
        let threshold = self.threshold.value();
        let mut representatives: Vec<NormalizedAddress> = Vec::new();
        let mut groups: Vec<SimilarityGroup<'a, T>> = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let normalized = address_of(record).map(normalize).unwrap_or_default();
            let slot = representatives
                .iter()
                .position(|rep| self.scorer.score(rep, &normalized) >= threshold);
            match slot {
                Some(slot) => {
                    groups[slot].members.push(record);
                    groups[slot].indices.push(index);
                }
                None => {
                    representatives.push(normalized);
                    groups.push(SimilarityGroup::open(index, record));
                }
            }
        }

        groups
    }
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(Threshold::default())
    }
}

impl fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupEngine")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Group `records` with the default scorer.
pub fn deduplicate<T, F>(
    records: &[T],
    address_of: F,
    threshold: u8,
) -> Result<Vec<SimilarityGroup<'_, T>>, ConfigurationError>
where
    F: Fn(&T) -> Option<&AddressFields>,
{
    let engine = DedupEngine::new(Threshold::new(threshold)?);
    Ok(engine.group(records, address_of))
}

/// Collapse a group into the record that gets persisted.
///
/// The representative supplies key and address; attribute gaps are filled
/// from later members in input order.
pub fn reduce_group(group: &SimilarityGroup<'_, RawRecord>) -> CanonicalProperty {
    let representative = group.representative();
    let mut attributes = representative.attributes.clone();
    let mut provenance = Provenance::new();
    let mut audit_artifacts: Vec<String> = Vec::new();
    let mut observed_at = representative.fetched_at;

    for member in &group.members {
        attributes.fill_missing_from(&member.attributes);
        provenance.add(&member.source_id, &member.external_id);
        for artifact in &member.audit_artifacts {
            if !audit_artifacts.contains(artifact) {
                audit_artifacts.push(artifact.clone());
            }
        }
        observed_at = observed_at.max(member.fetched_at);
    }

    CanonicalProperty {
        property_key: CanonicalProperty::property_key_for(
            &representative.source_id,
            &representative.external_id,
        ),
        address: representative.address.clone(),
        normalized: normalize(&representative.address),
        attributes,
        source_provenance: provenance,
        audit_artifacts,
        created_at: observed_at,
        updated_at: observed_at,
        stale_at: None,
        merged_into: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use reag_core::ListingAttributes;

    fn addr(line: &str) -> NormalizedAddress {
        normalize(&AddressFields::parse_single_line(line))
    }

    fn record(external_id: &str, line: &str, price: Option<f64>, beds: Option<f64>) -> RawRecord {
        RawRecord {
            source_id: "zillow".into(),
            external_id: external_id.into(),
            address: AddressFields::parse_single_line(line),
            attributes: ListingAttributes {
                price,
                beds,
                ..ListingAttributes::default()
            },
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
            audit_artifacts: vec![format!("zillow/20260301/{external_id}.json")],
        }
    }

    #[test]
    fn threshold_rejects_values_above_100() {
        assert_eq!(Threshold::new(100).unwrap().value(), 100);
        assert_eq!(Threshold::new(0).unwrap().value(), 0);
        assert_eq!(
            Threshold::new(101).unwrap_err(),
            ConfigurationError::ThresholdOutOfRange(101)
        );
        assert!(deduplicate(&[record("1", "1 A St", None, None)], |r| Some(&r.address), 150).is_err());
    }

    #[test]
    fn strict_threshold_must_not_be_looser_than_fuzzy() {
        assert!(DedupThresholds::new(95, 98).is_ok());
        assert!(DedupThresholds::new(95, 95).is_ok());
        assert_eq!(
            DedupThresholds::new(98, 95).unwrap_err(),
            ConfigurationError::ThresholdOrder { strict: 95, fuzzy: 98 }
        );
    }

    #[test]
    fn one_character_house_number_difference_scores_96() {
        let a = addr("123 Main St, Seattle, WA 98101");
        let b = addr("124 Main St, Seattle, WA 98101");
        assert_eq!(TokenSortRatio.score(&a, &b), 96);
        assert_eq!(LevenshteinRatio.score(&a, &b), 96);
    }

    #[test]
    fn token_sort_ignores_word_order() {
        let a = addr("Main 123 St, Seattle, WA 98101");
        let b = addr("123 Main St, Seattle, WA 98101");
        assert_eq!(TokenSortRatio.score(&a, &b), 100);
        assert!(LevenshteinRatio.score(&a, &b) < 100);
    }

    #[test]
    fn disjoint_addresses_score_low() {
        let a = addr("123 Main St, Seattle, WA 98101");
        let b = addr("9 Elm Rd, Boise, ID 83702");
        assert!(TokenSortRatio.score(&a, &b) < 50);
        assert_eq!(ratio("abc", ""), 0);
    }

    #[test]
    fn missing_address_is_treated_as_empty() {
        let records = vec![Some(AddressFields::default()), None, Some(AddressFields::new("1 A St", "", "", ""))];
        let groups = deduplicate(&records, |r| r.as_ref(), 100).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices, vec![0, 1]);
    }

    #[test]
    fn threshold_zero_merges_everything() {
        let records = vec![
            record("1", "123 Main St, Seattle, WA 98101", None, None),
            record("2", "9 Elm Rd, Boise, ID 83702", None, None),
            record("3", "", None, None),
        ];
        let groups = deduplicate(&records, |r| Some(&r.address), 0).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn custom_scorer_is_used() {
        struct Never;
        impl SimilarityScorer for Never {
            fn score(&self, _: &NormalizedAddress, _: &NormalizedAddress) -> u8 {
                0
            }
        }
        let records = vec![record("1", "1 A St", None, None), record("2", "1 A St", None, None)];
        let engine = DedupEngine::new(Threshold::new(50).unwrap()).with_scorer(Box::new(Never));
        assert_eq!(engine.group(&records, |r| Some(&r.address)).len(), 2);
    }

    #[test]
    fn reduce_group_keeps_representative_and_fills_gaps() {
        let records = vec![
            record("1", "123 Main St, Seattle, WA 98101", Some(725_000.0), None),
            record("2", "123 Main Street, Seattle, WA 98101", Some(700_000.0), Some(3.0)),
        ];
        let groups = deduplicate(&records, |r| Some(&r.address), 95).unwrap();
        assert_eq!(groups.len(), 1);

        let property = reduce_group(&groups[0]);
        assert_eq!(property.property_key, "zillow:1");
        assert_eq!(property.address.street, "123 Main St");
        assert_eq!(property.normalized.street, "123 main street");
        assert_eq!(property.attributes.price, Some(725_000.0));
        assert_eq!(property.attributes.beds, Some(3.0));
        assert!(property.source_provenance.contains("zillow", "1"));
        assert!(property.source_provenance.contains("zillow", "2"));
        assert_eq!(property.audit_artifacts.len(), 2);
        assert!(property.stale_at.is_none());
    }
}
