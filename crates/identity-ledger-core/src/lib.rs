use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, Duration};
use ulid::Ulid;

/// Version stamp recorded with every decision the rule cascade or the origin
/// resolver makes, so historical rows stay attributable after retuning.
pub const RULESET_VERSION: &str = "match-rules.v1";

/// Rule code recorded on links created by minting a new person.
pub const MATCH_RULE_MINT: &str = "MINT_NEW";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PersonId(pub Ulid);

impl PersonId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PersonId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PersonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NoCandidates,
    AmbiguousCandidates,
    MissingRequiredAttributes,
    MalformedInput,
}

impl ReasonCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCandidates => "no_candidates",
            Self::AmbiguousCandidates => "ambiguous_candidates",
            Self::MissingRequiredAttributes => "missing_required_attributes",
            Self::MalformedInput => "malformed_input",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_candidates" => Some(Self::NoCandidates),
            "ambiguous_candidates" => Some(Self::AmbiguousCandidates),
            "missing_required_attributes" => Some(Self::MissingRequiredAttributes),
            "malformed_input" => Some(Self::MalformedInput),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedStatus {
    Open,
    Resolved,
    Ignored,
}

impl UnmatchedStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    System,
    Manual,
}

impl DecidedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    PendingReview,
    ResolvedAuto,
    ResolvedManual,
    MarkedLegacy,
    Discarded,
}

impl ResolutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::ResolvedAuto => "resolved_auto",
            Self::ResolvedManual => "resolved_manual",
            Self::MarkedLegacy => "marked_legacy",
            Self::Discarded => "discarded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_review" => Some(Self::PendingReview),
            "resolved_auto" => Some(Self::ResolvedAuto),
            "resolved_manual" => Some(Self::ResolvedManual),
            "marked_legacy" => Some(Self::MarkedLegacy),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }

    /// Whether a status change is allowed under the origin state machine.
    ///
    /// The engine may only flip between `pending_review` and `resolved_auto`;
    /// every other transition requires a human decider and is always logged.
    /// No path, human or otherwise, may set `resolved_auto` by hand.
    #[must_use]
    pub fn can_transition(self, next: Self, decided_by: DecidedBy) -> bool {
        match decided_by {
            DecidedBy::System => matches!(
                (self, next),
                (Self::PendingReview | Self::ResolvedAuto, Self::PendingReview)
                    | (Self::PendingReview | Self::ResolvedAuto, Self::ResolvedAuto)
            ),
            DecidedBy::Manual => next != Self::ResolvedAuto,
        }
    }

    /// Statuses the engine must leave alone during automatic reconciliation.
    #[must_use]
    pub fn is_manually_settled(self) -> bool {
        matches!(self, Self::ResolvedManual | Self::MarkedLegacy | Self::Discarded)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Matched,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "matched" => Some(Self::Matched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Identity of one row in one operational source table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceKey {
    pub source_table: String,
    pub source_pk: String,
}

impl SourceKey {
    #[must_use]
    pub fn new(source_table: &str, source_pk: &str) -> Self {
        Self { source_table: source_table.to_string(), source_pk: source_pk.to_string() }
    }
}

impl Display for SourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_table, self.source_pk)
    }
}

/// Attribute values exactly as the operational source recorded them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawAttributes {
    pub phone: Option<String>,
    pub license: Option<String>,
    pub plate: Option<String>,
    pub name: Option<String>,
}

/// Canonical comparable forms produced by the normalizer. Absent means the
/// source either had no value or the value normalized away entirely; an
/// empty string never appears here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedAttributes {
    pub phone: Option<String>,
    pub license: Option<String>,
    pub plate: Option<String>,
    pub name: Option<String>,
}

impl NormalizedAttributes {
    #[must_use]
    pub fn from_raw(raw: &RawAttributes, config: &MatchingConfig) -> Self {
        Self {
            phone: raw.phone.as_deref().and_then(|value| normalize_phone(value, config)),
            license: raw.license.as_deref().and_then(normalize_document),
            plate: raw.plate.as_deref().and_then(normalize_document),
            name: raw.name.as_deref().and_then(normalize_name),
        }
    }

    #[must_use]
    pub fn has_any(&self) -> bool {
        self.phone.is_some() || self.license.is_some() || self.plate.is_some() || self.name.is_some()
    }

    /// Minting a person requires a name plus at least one strong identifier,
    /// otherwise the minted identity could never be matched against again.
    #[must_use]
    pub fn supports_minting(&self) -> bool {
        self.name.is_some()
            && (self.phone.is_some() || self.license.is_some() || self.plate.is_some())
    }
}

/// Normalize a phone into its canonical comparable form: digits only, `00`
/// international prefix dropped, then the trailing `phone_significant_digits`
/// retained so `+51 987-654-321` and `987654321` compare equal. Returns
/// `None` when fewer digits remain than `phone_suffix_len`, which is too
/// short to compare against anything.
#[must_use]
pub fn normalize_phone(raw: &str, config: &MatchingConfig) -> Option<String> {
    let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if let Some(stripped) = digits.strip_prefix("00") {
        digits = stripped.to_string();
    }
    if digits.len() > config.phone_significant_digits {
        let cut = digits.len() - config.phone_significant_digits;
        digits = digits[cut..].to_string();
    }
    if digits.len() < config.phone_suffix_len {
        return None;
    }
    Some(digits)
}

/// Trailing suffix of an already-normalized phone, used for cross-format
/// comparison when one side lost leading digits.
#[must_use]
pub fn phone_suffix(phone: &str, len: usize) -> &str {
    if phone.len() > len {
        &phone[phone.len() - len..]
    } else {
        phone
    }
}

/// Normalize a license/document or plate string: uppercase, alphanumerics
/// only. `"abc-123"` and `"ABC 123"` both become `"ABC123"`.
#[must_use]
pub fn normalize_document(raw: &str) -> Option<String> {
    let folded: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    if folded.is_empty() {
        None
    } else {
        Some(folded)
    }
}

/// Normalize a full name: fold diacritics to their ASCII base letter,
/// uppercase, turn punctuation into spaces, collapse whitespace runs.
#[must_use]
pub fn normalize_name(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        let folded = fold_diacritic(ch);
        if folded.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for upper in folded.to_uppercase() {
                out.push(upper);
            }
        } else {
            pending_space = true;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Deterministic fold for the Latin diacritics the operational sources
/// produce. Characters outside the table pass through unchanged.
fn fold_diacritic(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ç' => 'c',
        'Ç' => 'C',
        'ý' | 'ÿ' => 'y',
        'Ý' => 'Y',
        'š' => 's',
        'Š' => 'S',
        'ž' => 'z',
        'Ž' => 'Z',
        other => other,
    }
}

/// Jaro-Winkler similarity over already-normalized names.
#[must_use]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(a, b)
}

/// Contract for one operational source table. The partition column name is
/// configuration documenting where the ingestion layer reads the partition
/// value from; it is never inferred from data.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceSpec {
    pub table: String,
    pub may_mint: bool,
    #[serde(default)]
    pub origin_tag: Option<String>,
    #[serde(default)]
    pub partition_column: Option<String>,
}

impl SourceSpec {
    #[must_use]
    pub fn origin_qualifying(&self) -> bool {
        self.origin_tag.is_some()
    }
}

/// Tunable matching policy. The numeric defaults are deployment policy, not
/// derivable constants; see DESIGN.md for how each was chosen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchingConfig {
    pub phone_significant_digits: usize,
    pub phone_suffix_len: usize,
    pub name_similarity_threshold: f64,
    pub medium_confidence_margin: f64,
    pub plate_window_before_days: i64,
    pub plate_window_after_days: i64,
    pub origin_conflict_tolerance_days: i64,
    pub max_match_attempts: u32,
    pub sources: Vec<SourceSpec>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            phone_significant_digits: 9,
            phone_suffix_len: 8,
            name_similarity_threshold: 0.88,
            medium_confidence_margin: 0.05,
            plate_window_before_days: 180,
            plate_window_after_days: 30,
            origin_conflict_tolerance_days: 7,
            max_match_attempts: 5,
            sources: vec![
                SourceSpec {
                    table: "driver_master".to_string(),
                    may_mint: true,
                    origin_tag: None,
                    partition_column: None,
                },
                SourceSpec {
                    table: "lead_capture".to_string(),
                    may_mint: true,
                    origin_tag: Some("lead_form".to_string()),
                    partition_column: Some("city_code".to_string()),
                },
                SourceSpec {
                    table: "scouting_log".to_string(),
                    may_mint: false,
                    origin_tag: Some("scout".to_string()),
                    partition_column: Some("city_code".to_string()),
                },
                SourceSpec {
                    table: "legacy_roster".to_string(),
                    may_mint: true,
                    origin_tag: Some("legacy".to_string()),
                    partition_column: None,
                },
            ],
        }
    }
}

impl MatchingConfig {
    /// Validate policy bounds before any run uses this configuration.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when thresholds fall outside their
    /// usable ranges or the source list is empty or duplicated.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.phone_suffix_len < 6 {
            return Err(LedgerError::Validation(
                "phone_suffix_len MUST be at least 6 to bound false positives".to_string(),
            ));
        }
        if self.phone_suffix_len > self.phone_significant_digits {
            return Err(LedgerError::Validation(
                "phone_suffix_len MUST NOT exceed phone_significant_digits".to_string(),
            ));
        }
        if !(0.5..=1.0).contains(&self.name_similarity_threshold) {
            return Err(LedgerError::Validation(
                "name_similarity_threshold MUST be in [0.5, 1.0]".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.medium_confidence_margin) {
            return Err(LedgerError::Validation(
                "medium_confidence_margin MUST be in [0.0, 0.5]".to_string(),
            ));
        }
        if self.plate_window_before_days < 0 || self.plate_window_after_days < 0 {
            return Err(LedgerError::Validation(
                "plate window bounds MUST be non-negative day counts".to_string(),
            ));
        }
        if self.origin_conflict_tolerance_days < 0 {
            return Err(LedgerError::Validation(
                "origin_conflict_tolerance_days MUST be non-negative".to_string(),
            ));
        }
        if self.max_match_attempts == 0 {
            return Err(LedgerError::Validation(
                "max_match_attempts MUST be at least 1".to_string(),
            ));
        }
        if self.sources.is_empty() {
            return Err(LedgerError::Validation(
                "at least one source table MUST be configured".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.sources {
            if spec.table.trim().is_empty() {
                return Err(LedgerError::Validation(
                    "source table names MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(spec.table.as_str()) {
                return Err(LedgerError::Validation(format!(
                    "source table configured twice: {}",
                    spec.table
                )));
            }
            if let Some(tag) = &spec.origin_tag {
                if tag.trim().is_empty() {
                    return Err(LedgerError::Validation(format!(
                        "origin_tag for {} MUST be non-empty when present",
                        spec.table
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn source(&self, table: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|spec| spec.table == table)
    }
}

/// One unlinked source record as presented to the rule cascade.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchInput {
    pub key: SourceKey,
    pub record_date: Date,
    pub partition: Option<String>,
    pub attributes: NormalizedAttributes,
}

/// One already-linked source row in the candidate snapshot the cascade
/// searches. Several rows may map to the same person.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateRecord {
    pub person_id: PersonId,
    pub key: SourceKey,
    pub record_date: Date,
    pub partition: Option<String>,
    pub attributes: NormalizedAttributes,
}

/// Human-triage preview of one candidate an inconclusive rule saw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidatePreview {
    pub person_id: PersonId,
    pub source_table: String,
    pub source_pk: String,
    pub name: Option<String>,
    pub similarity: Option<f64>,
    pub rule: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Match { person_id: PersonId, confidence: ConfidenceLevel, score: f64, evidence: Vec<String> },
    Ambiguous { candidates: Vec<CandidatePreview> },
    NoCandidates,
    MissingAttributes,
}

/// One deterministic matching rule. Rules are evaluated in a fixed order and
/// must fall through (never guess) when they see anything but exactly one
/// qualifying person.
pub trait MatchRule {
    fn code(&self) -> &'static str;

    fn evaluate(
        &self,
        input: &MatchInput,
        candidates: &[CandidateRecord],
        config: &MatchingConfig,
    ) -> RuleOutcome;
}

fn partition_matches(input: Option<&str>, candidate: Option<&str>) -> bool {
    match input {
        Some(value) => candidate == Some(value),
        None => true,
    }
}

/// Group matching rows by person, preserving deterministic order.
fn group_by_person<'a>(
    rows: impl Iterator<Item = &'a CandidateRecord>,
) -> BTreeMap<PersonId, Vec<&'a CandidateRecord>> {
    let mut grouped: BTreeMap<PersonId, Vec<&'a CandidateRecord>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.person_id).or_default().push(row);
    }
    // Row order inside a group must not depend on snapshot load order.
    for rows in grouped.values_mut() {
        rows.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
    }
    grouped
}

fn exact_attribute_outcome(
    rule: &'static str,
    attribute: &str,
    value: &str,
    confidence: ConfidenceLevel,
    score: f64,
    grouped: BTreeMap<PersonId, Vec<&CandidateRecord>>,
) -> RuleOutcome {
    match grouped.len() {
        0 => RuleOutcome::NoCandidates,
        1 => {
            let Some((person_id, rows)) = grouped.into_iter().next() else {
                return RuleOutcome::NoCandidates;
            };
            let evidence = rows
                .iter()
                .take(5)
                .map(|row| format!("{attribute} {value} equals linked row {}", row.key))
                .collect();
            RuleOutcome::Match { person_id, confidence, score, evidence }
        }
        _ => {
            let mut previews: Vec<CandidatePreview> = grouped
                .into_iter()
                .filter_map(|(person_id, rows)| {
                    rows.first().map(|row| CandidatePreview {
                        person_id,
                        source_table: row.key.source_table.clone(),
                        source_pk: row.key.source_pk.clone(),
                        name: row.attributes.name.clone(),
                        similarity: None,
                        rule: rule.to_string(),
                    })
                })
                .collect();
            previews.sort_by(|lhs, rhs| {
                lhs.person_id
                    .cmp(&rhs.person_id)
                    .then_with(|| lhs.source_table.cmp(&rhs.source_table))
                    .then_with(|| lhs.source_pk.cmp(&rhs.source_pk))
            });
            RuleOutcome::Ambiguous { candidates: previews }
        }
    }
}

/// Rank person groups by their best name similarity against the input name.
/// Returns qualifying persons (at or above threshold) sorted by similarity
/// descending with deterministic tie-breaking.
fn rank_by_name<'a>(
    input_name: &str,
    grouped: &BTreeMap<PersonId, Vec<&'a CandidateRecord>>,
    threshold: f64,
) -> Vec<(PersonId, f64, &'a CandidateRecord)> {
    let mut ranked: Vec<(PersonId, f64, &'a CandidateRecord)> = Vec::new();
    for (person_id, rows) in grouped {
        let mut best: Option<(f64, &'a CandidateRecord)> = None;
        for &row in rows {
            let Some(candidate_name) = row.attributes.name.as_deref() else {
                continue;
            };
            let similarity = name_similarity(input_name, candidate_name);
            let better = match best {
                Some((current, _)) => similarity > current,
                None => true,
            };
            if better {
                best = Some((similarity, row));
            }
        }
        if let Some((similarity, row)) = best {
            if similarity >= threshold {
                ranked.push((*person_id, similarity, row));
            }
        }
    }
    ranked.sort_by(|lhs, rhs| {
        rhs.1
            .partial_cmp(&lhs.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lhs.0.cmp(&rhs.0))
            .then_with(|| lhs.2.key.cmp(&rhs.2.key))
    });
    ranked
}

fn similarity_previews(
    rule: &'static str,
    ranked: &[(PersonId, f64, &CandidateRecord)],
) -> Vec<CandidatePreview> {
    ranked
        .iter()
        .map(|(person_id, similarity, row)| CandidatePreview {
            person_id: *person_id,
            source_table: row.key.source_table.clone(),
            source_pk: row.key.source_pk.clone(),
            name: row.attributes.name.clone(),
            similarity: Some(*similarity),
            rule: rule.to_string(),
        })
        .collect()
}

/// Rule 1: exact normalized phone within partition. Phones are the strongest
/// signal the sources carry, so a unique hit is HIGH confidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhoneExactRule;

pub const RULE_PHONE_EXACT: &str = "R1_PHONE_EXACT";
pub const RULE_DOCUMENT_EXACT: &str = "R2_DOCUMENT_EXACT";
pub const RULE_PLATE_NAME_WINDOW: &str = "R3_PLATE_NAME_WINDOW";
pub const RULE_PHONE_SUFFIX_NAME: &str = "R4_PHONE_SUFFIX_NAME";

pub const SCORE_PHONE_EXACT: f64 = 0.95;
pub const SCORE_DOCUMENT_EXACT: f64 = 0.90;

impl MatchRule for PhoneExactRule {
    fn code(&self) -> &'static str {
        RULE_PHONE_EXACT
    }

    fn evaluate(
        &self,
        input: &MatchInput,
        candidates: &[CandidateRecord],
        _config: &MatchingConfig,
    ) -> RuleOutcome {
        let Some(phone) = input.attributes.phone.as_deref() else {
            return RuleOutcome::MissingAttributes;
        };
        let grouped = group_by_person(candidates.iter().filter(|row| {
            row.attributes.phone.as_deref() == Some(phone)
                && partition_matches(input.partition.as_deref(), row.partition.as_deref())
        }));
        exact_attribute_outcome(
            RULE_PHONE_EXACT,
            "phone",
            phone,
            ConfidenceLevel::High,
            SCORE_PHONE_EXACT,
            grouped,
        )
    }
}

/// Rule 2: exact license/document match. Slightly weaker than phone because
/// document strings are retyped by hand more often.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExactRule;

impl MatchRule for DocumentExactRule {
    fn code(&self) -> &'static str {
        RULE_DOCUMENT_EXACT
    }

    fn evaluate(
        &self,
        input: &MatchInput,
        candidates: &[CandidateRecord],
        _config: &MatchingConfig,
    ) -> RuleOutcome {
        let Some(license) = input.attributes.license.as_deref() else {
            return RuleOutcome::MissingAttributes;
        };
        let grouped = group_by_person(
            candidates.iter().filter(|row| row.attributes.license.as_deref() == Some(license)),
        );
        exact_attribute_outcome(
            RULE_DOCUMENT_EXACT,
            "license",
            license,
            ConfidenceLevel::High,
            SCORE_DOCUMENT_EXACT,
            grouped,
        )
    }
}

/// Rule 3: exact plate plus fuzzy name, bounded to a date window around the
/// record date. Plates get reused and re-registered over time; the window is
/// what keeps plate+name from matching a prior holder of the same plate.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlateNameWindowRule;

impl MatchRule for PlateNameWindowRule {
    fn code(&self) -> &'static str {
        RULE_PLATE_NAME_WINDOW
    }

    fn evaluate(
        &self,
        input: &MatchInput,
        candidates: &[CandidateRecord],
        config: &MatchingConfig,
    ) -> RuleOutcome {
        let (Some(plate), Some(name)) =
            (input.attributes.plate.as_deref(), input.attributes.name.as_deref())
        else {
            return RuleOutcome::MissingAttributes;
        };

        let window_start = input
            .record_date
            .checked_sub(Duration::days(config.plate_window_before_days))
            .unwrap_or(Date::MIN);
        let window_end = input
            .record_date
            .checked_add(Duration::days(config.plate_window_after_days))
            .unwrap_or(Date::MAX);

        let grouped = group_by_person(candidates.iter().filter(|row| {
            row.attributes.plate.as_deref() == Some(plate)
                && partition_matches(input.partition.as_deref(), row.partition.as_deref())
                && row.record_date >= window_start
                && row.record_date <= window_end
        }));
        if grouped.is_empty() {
            return RuleOutcome::NoCandidates;
        }

        let ranked = rank_by_name(name, &grouped, config.name_similarity_threshold);
        match ranked.len() {
            0 => RuleOutcome::NoCandidates,
            1 => {
                let (person_id, similarity, row) = &ranked[0];
                RuleOutcome::Match {
                    person_id: *person_id,
                    confidence: ConfidenceLevel::Medium,
                    score: *similarity,
                    evidence: vec![
                        format!("plate {plate} equals linked row {}", row.key),
                        format!(
                            "name similarity {:.3} within window {window_start} to {window_end}",
                            similarity
                        ),
                    ],
                }
            }
            _ => RuleOutcome::Ambiguous {
                candidates: similarity_previews(RULE_PLATE_NAME_WINDOW, &ranked),
            },
        }
    }
}

/// Confidence tier for a similarity-backed match: MEDIUM once the similarity
/// clears the threshold by the configured margin, LOW in the band just above
/// the threshold.
#[must_use]
pub fn margin_confidence(similarity: f64, config: &MatchingConfig) -> ConfidenceLevel {
    if similarity >= config.name_similarity_threshold + config.medium_confidence_margin {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    }
}

/// Rule 4: trailing phone-suffix plus fuzzy name, for records whose phone
/// lost or mangled its country prefix. Confidence depends on how far above
/// the threshold the name similarity lands.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhoneSuffixNameRule;

impl MatchRule for PhoneSuffixNameRule {
    fn code(&self) -> &'static str {
        RULE_PHONE_SUFFIX_NAME
    }

    fn evaluate(
        &self,
        input: &MatchInput,
        candidates: &[CandidateRecord],
        config: &MatchingConfig,
    ) -> RuleOutcome {
        let (Some(phone), Some(name)) =
            (input.attributes.phone.as_deref(), input.attributes.name.as_deref())
        else {
            return RuleOutcome::MissingAttributes;
        };
        let suffix = phone_suffix(phone, config.phone_suffix_len);

        let grouped = group_by_person(candidates.iter().filter(|row| {
            row.attributes
                .phone
                .as_deref()
                .is_some_and(|candidate| phone_suffix(candidate, config.phone_suffix_len) == suffix)
                && partition_matches(input.partition.as_deref(), row.partition.as_deref())
        }));
        if grouped.is_empty() {
            return RuleOutcome::NoCandidates;
        }

        let ranked = rank_by_name(name, &grouped, config.name_similarity_threshold);
        match ranked.len() {
            0 => RuleOutcome::NoCandidates,
            1 => {
                let (person_id, similarity, row) = &ranked[0];
                let confidence = margin_confidence(*similarity, config);
                RuleOutcome::Match {
                    person_id: *person_id,
                    confidence,
                    score: *similarity,
                    evidence: vec![
                        format!("phone suffix {suffix} equals linked row {}", row.key),
                        format!("name similarity {similarity:.3}"),
                    ],
                }
            }
            _ => RuleOutcome::Ambiguous {
                candidates: similarity_previews(RULE_PHONE_SUFFIX_NAME, &ranked),
            },
        }
    }
}

/// The ordered cascade. First decisive rule wins; order is part of the
/// published contract and changing it is a ruleset version bump.
#[must_use]
pub fn default_rules() -> Vec<Box<dyn MatchRule>> {
    vec![
        Box::new(PhoneExactRule),
        Box::new(DocumentExactRule),
        Box::new(PlateNameWindowRule),
        Box::new(PhoneSuffixNameRule),
    ]
}

/// Terminal decision for one input record.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Attach {
        person_id: PersonId,
        rule: String,
        confidence: ConfidenceLevel,
        score: f64,
        evidence: Vec<String>,
    },
    Mint {
        rule: String,
        confidence: ConfidenceLevel,
        score: f64,
        evidence: Vec<String>,
    },
    Quarantine {
        reason: ReasonCode,
        details: String,
        candidates: Vec<CandidatePreview>,
    },
}

/// Run the default cascade for one record and settle its terminal outcome.
#[must_use]
pub fn decide_match(
    input: &MatchInput,
    candidates: &[CandidateRecord],
    spec: &SourceSpec,
    config: &MatchingConfig,
) -> MatchOutcome {
    decide_match_with(&default_rules(), input, candidates, spec, config)
}

/// Cascade driver. Ambiguity observed by any rule poisons the record for
/// this pass: it must never fall through to minting, because the tie means a
/// real person probably already exists.
#[must_use]
pub fn decide_match_with(
    rules: &[Box<dyn MatchRule>],
    input: &MatchInput,
    candidates: &[CandidateRecord],
    spec: &SourceSpec,
    config: &MatchingConfig,
) -> MatchOutcome {
    let mut first_ambiguity: Option<(&'static str, Vec<CandidatePreview>)> = None;
    let mut rules_with_attributes = 0_usize;

    for rule in rules {
        match rule.evaluate(input, candidates, config) {
            RuleOutcome::Match { person_id, confidence, score, evidence } => {
                return MatchOutcome::Attach {
                    person_id,
                    rule: rule.code().to_string(),
                    confidence,
                    score,
                    evidence,
                };
            }
            RuleOutcome::Ambiguous { candidates: previews } => {
                rules_with_attributes += 1;
                if first_ambiguity.is_none() {
                    first_ambiguity = Some((rule.code(), previews));
                }
            }
            RuleOutcome::NoCandidates => {
                rules_with_attributes += 1;
            }
            RuleOutcome::MissingAttributes => {}
        }
    }

    if let Some((code, previews)) = first_ambiguity {
        return MatchOutcome::Quarantine {
            reason: ReasonCode::AmbiguousCandidates,
            details: format!("rule {code} found multiple equally ranked candidates"),
            candidates: previews,
        };
    }

    if rules_with_attributes == 0 {
        return MatchOutcome::Quarantine {
            reason: ReasonCode::MissingRequiredAttributes,
            details: "record carries no attribute any matching rule can compare".to_string(),
            candidates: Vec::new(),
        };
    }

    if spec.may_mint {
        if input.attributes.supports_minting() {
            return MatchOutcome::Mint {
                rule: MATCH_RULE_MINT.to_string(),
                confidence: ConfidenceLevel::High,
                score: 1.0,
                evidence: vec![format!(
                    "no existing candidate matched; {} is identity-originating",
                    spec.table
                )],
            };
        }
        return MatchOutcome::Quarantine {
            reason: ReasonCode::MissingRequiredAttributes,
            details: "minting requires a name plus one of phone/license/plate".to_string(),
            candidates: Vec::new(),
        };
    }

    MatchOutcome::Quarantine {
        reason: ReasonCode::NoCandidates,
        details: format!("no candidate matched and {} may not mint identities", spec.table),
        candidates: Vec::new(),
    }
}

/// One link of a person as the origin resolver sees it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OriginLinkView {
    pub key: SourceKey,
    pub snapshot_date: Date,
    pub confidence: ConfidenceLevel,
}

/// One origin channel competing for a person, with its earliest evidence.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OriginContender {
    pub origin_tag: String,
    pub source: SourceKey,
    pub earliest_date: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OriginConflict {
    pub contenders: Vec<OriginContender>,
}

/// Outcome of origin determination for one person.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginDecision {
    pub origin_tag: String,
    pub source: SourceKey,
    pub source_date: Date,
    pub confidence: ConfidenceLevel,
    pub resolution_status: ResolutionStatus,
    pub evidence: Vec<String>,
    pub conflict: Option<OriginConflict>,
}

/// Select the origin channel for a person from its links: earliest link from
/// an origin-qualifying source wins. Distinct tags whose earliest dates land
/// within the tolerance window dispute the origin and force human review.
///
/// Returns `None` when the person has no origin-qualifying link at all.
#[must_use]
pub fn determine_origin(
    links: &[OriginLinkView],
    config: &MatchingConfig,
) -> Option<OriginDecision> {
    let mut earliest_per_tag: BTreeMap<String, (Date, SourceKey, ConfidenceLevel)> =
        BTreeMap::new();
    for link in links {
        let Some(spec) = config.source(&link.key.source_table) else {
            continue;
        };
        let Some(tag) = spec.origin_tag.clone() else {
            continue;
        };
        let replace = match earliest_per_tag.get(&tag) {
            Some((date, key, _)) => {
                link.snapshot_date < *date || (link.snapshot_date == *date && link.key < *key)
            }
            None => true,
        };
        if replace {
            earliest_per_tag.insert(tag, (link.snapshot_date, link.key.clone(), link.confidence));
        }
    }

    let mut contenders: Vec<(String, Date, SourceKey, ConfidenceLevel)> = earliest_per_tag
        .into_iter()
        .map(|(tag, (date, key, confidence))| (tag, date, key, confidence))
        .collect();
    if contenders.is_empty() {
        return None;
    }
    contenders.sort_by(|lhs, rhs| {
        lhs.1.cmp(&rhs.1).then_with(|| lhs.0.cmp(&rhs.0)).then_with(|| lhs.2.cmp(&rhs.2))
    });

    let (winner_tag, winner_date, winner_key, winner_confidence) = contenders[0].clone();

    let disputed: Vec<OriginContender> = contenders
        .iter()
        .filter(|(tag, date, _, _)| {
            *tag != winner_tag
                && (*date - winner_date).whole_days() <= config.origin_conflict_tolerance_days
        })
        .map(|(tag, date, key, _)| OriginContender {
            origin_tag: tag.clone(),
            source: key.clone(),
            earliest_date: *date,
        })
        .collect();

    let mut evidence = vec![format!(
        "earliest qualifying link {winner_key} dated {winner_date} carries tag {winner_tag}"
    )];
    let conflict = if disputed.is_empty() {
        None
    } else {
        let mut all = vec![OriginContender {
            origin_tag: winner_tag.clone(),
            source: winner_key.clone(),
            earliest_date: winner_date,
        }];
        all.extend(disputed);
        for contender in &all[1..] {
            evidence.push(format!(
                "tag {} from {} dated {} lands within the {}-day tolerance",
                contender.origin_tag,
                contender.source,
                contender.earliest_date,
                config.origin_conflict_tolerance_days
            ));
        }
        Some(OriginConflict { contenders: all })
    };

    Some(OriginDecision {
        origin_tag: winner_tag,
        source: winner_key,
        source_date: winner_date,
        confidence: winner_confidence,
        resolution_status: if conflict.is_some() {
            ResolutionStatus::PendingReview
        } else {
            ResolutionStatus::ResolvedAuto
        },
        evidence,
        conflict,
    })
}
