//! Loan offer model.
//!
//! Offers come out of document extraction, so every field tolerates the
//! `"MISSING"` sentinel and loosely formatted numbers ("$500k", "75%").
//! Values that cannot be read are dropped to "missing" and reported by
//! [`OfferTerms::conform`] rather than kept as strings.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::regions::canonical_region;

/// Sentinel the extractor uses for fields absent from a document.
pub const MISSING: &str = "MISSING";

// ============================================================================
// Number normalisation
// ============================================================================

/// Parse a loosely formatted number: currency symbols, separators, percent
/// signs and `k`/`m`/`mm`/`b`/`x` suffixes are accepted.
pub fn normalize_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '%' | ' ' | '_'))
        .collect::<String>()
        .to_ascii_lowercase();

    if cleaned.is_empty() || cleaned == "missing" {
        return None;
    }

    let (digits, multiplier) = if let Some(d) = cleaned.strip_suffix("million") {
        (d, 1e6)
    } else if let Some(d) = cleaned.strip_suffix("mm") {
        (d, 1e6)
    } else if let Some(d) = cleaned.strip_suffix('k') {
        (d, 1e3)
    } else if let Some(d) = cleaned.strip_suffix('m') {
        (d, 1e6)
    } else if let Some(d) = cleaned.strip_suffix('b') {
        (d, 1e9)
    } else if let Some(d) = cleaned.strip_suffix('x') {
        (d, 1.0)
    } else {
        (cleaned.as_str(), 1.0)
    };

    digits
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v * multiplier)
}

fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => normalize_number(s),
        _ => None,
    }
}

fn is_missing_marker(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case(MISSING)
        }
        _ => false,
    }
}

/// Split "5 - 10%" or "5 to 10" into its two bounds.
fn split_range_text(s: &str) -> Option<(f64, f64)> {
    let body = s.trim();
    let (a, b) = match body.split_once(" to ") {
        Some(pair) => pair,
        None => {
            // skip index 0 so a leading sign is not read as a separator
            let idx = body
                .char_indices()
                .skip(1)
                .find(|(_, c)| *c == '-')
                .map(|(i, _)| i)?;
            (&body[..idx], &body[idx + 1..])
        }
    };
    let pct = body.contains('%');
    let fix = |part: &str| {
        if pct && !part.contains('%') {
            normalize_number(&format!("{}%", part))
        } else {
            normalize_number(part)
        }
    };
    Some((fix(a)?, fix(b)?))
}

// ============================================================================
// NumericRange
// ============================================================================

/// Inclusive numeric bounds. An absent side is serialized as `"MISSING"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, JsonSchema)]
pub struct NumericRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericRange {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn is_missing(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Read a range from extractor output. Accepts `{min, max}` objects,
    /// a single number (both bounds) or range text like `"65-75%"`.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self {
                min: map.get("min").and_then(number_from_value),
                max: map.get("max").and_then(number_from_value),
            },
            Value::Number(_) => {
                let v = number_from_value(value);
                Self { min: v, max: v }
            }
            Value::String(s) => {
                if let Some((a, b)) = split_range_text(s) {
                    Self::new(Some(a.min(b)), Some(a.max(b)))
                } else {
                    let v = normalize_number(s);
                    Self { min: v, max: v }
                }
            }
            _ => Self::default(),
        }
    }
}

impl Serialize for NumericRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("NumericRange", 2)?;
        match self.min {
            Some(v) => state.serialize_field("min", &v)?,
            None => state.serialize_field("min", MISSING)?,
        }
        match self.max {
            Some(v) => state.serialize_field("max", &v)?,
            None => state.serialize_field("max", MISSING)?,
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for NumericRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

// ============================================================================
// Tri-state flags
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    Yes,
    No,
    #[default]
    #[serde(rename = "MISSING")]
    Missing,
}

impl TriState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriState::Yes => "yes",
            TriState::No => "no",
            TriState::Missing => MISSING,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" => TriState::Yes,
            "no" | "n" | "false" => TriState::No,
            _ => TriState::Missing,
        }
    }
}

impl<'de> Deserialize<'de> for TriState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(true) => TriState::Yes,
            Value::Bool(false) => TriState::No,
            Value::String(s) => TriState::parse(&s),
            _ => TriState::Missing,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Guarantee {
    Yes,
    No,
    Partial,
    #[default]
    #[serde(rename = "MISSING")]
    Missing,
}

impl Guarantee {
    pub fn as_str(&self) -> &'static str {
        match self {
            Guarantee::Yes => "yes",
            Guarantee::No => "no",
            Guarantee::Partial => "partial",
            Guarantee::Missing => MISSING,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "partial" | "partially" | "limited" => Guarantee::Partial,
            other => match TriState::parse(other) {
                TriState::Yes => Guarantee::Yes,
                TriState::No => Guarantee::No,
                TriState::Missing => Guarantee::Missing,
            },
        }
    }
}

impl<'de> Deserialize<'de> for Guarantee {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(true) => Guarantee::Yes,
            Value::Bool(false) => Guarantee::No,
            Value::String(s) => Guarantee::parse(&s),
            _ => Guarantee::Missing,
        })
    }
}

// ============================================================================
// Lenient field codecs
// ============================================================================

mod lenient {
    use super::*;

    fn text_of(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !is_missing_marker(value) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(text_of).collect();
                (!parts.is_empty()).then(|| parts.join(", "))
            }
            _ => None,
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(text_of(&Value::deserialize(d)?))
    }

    pub fn text_or_missing<S: Serializer>(v: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(v.as_deref().unwrap_or(MISSING))
    }

    pub fn list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.iter().filter_map(text_of).collect(),
            other => text_of(&other).into_iter().collect(),
        })
    }

    pub fn regions<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let raw: Vec<String> = match Value::deserialize(d)? {
            Value::Array(items) => items.iter().filter_map(text_of).collect(),
            other => text_of(&other).into_iter().collect(),
        };
        let mut codes: Vec<String> = Vec::new();
        for entry in raw {
            for part in entry.split([',', ';', '/']) {
                if let Some(code) = canonical_region(part) {
                    if !codes.contains(&code) {
                        codes.push(code);
                    }
                }
            }
        }
        Ok(codes)
    }
}

// ============================================================================
// OfferTerms
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContactInformation {
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub person: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub email: Option<String>,
}

impl ContactInformation {
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        [&self.person, &self.phone, &self.email]
            .into_iter()
            .filter_map(|p| p.as_deref())
    }
}

/// The structured terms extracted from a lender document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OfferTerms {
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub company_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub loan_plans: Option<String>,
    /// Canonical upper-case region codes.
    #[serde(default, deserialize_with = "lenient::regions")]
    pub service_areas: Vec<String>,
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub credit_score_requirements: Option<String>,
    #[serde(default)]
    pub loan_amount: NumericRange,
    #[serde(default)]
    pub ltv_ratio: NumericRange,
    #[serde(default, deserialize_with = "lenient::list")]
    pub application_requirements: Vec<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub guidelines: Vec<String>,
    #[serde(default)]
    pub contact_information: ContactInformation,
    #[serde(default, deserialize_with = "lenient::list")]
    pub property_types: Vec<String>,
    #[serde(default)]
    pub interest_rate: NumericRange,
    #[serde(default)]
    pub points_charged: NumericRange,
    #[serde(default, deserialize_with = "lenient::list")]
    pub liquidity_requirements: Vec<String>,
    #[serde(default)]
    pub ltc_ratio: NumericRange,
    #[serde(default)]
    pub dscr: NumericRange,
    #[serde(default)]
    pub loan_term: NumericRange,
    #[serde(default, deserialize_with = "lenient::text", serialize_with = "lenient::text_or_missing")]
    pub amortization: Option<String>,
    #[serde(default)]
    pub construction: TriState,
    #[serde(default)]
    pub value_add: TriState,
    #[serde(default)]
    pub personal_guarantee: Guarantee,
}

/// Borrowed view of one schema field.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Text(Option<&'a str>),
    List(&'a [String]),
    Range(&'a NumericRange),
    Flag(&'static str),
    Contact(&'a ContactInformation),
}

impl OfferTerms {
    /// Deserialize extractor output and collect conformance issues: bounds
    /// that could not be read as numbers and internally inconsistent ranges.
    pub fn conform(raw: &Value) -> Result<(Self, Vec<String>), serde_json::Error> {
        let terms: OfferTerms = serde_json::from_value(raw.clone())?;
        let mut issues = Vec::new();

        for field in SchemaField::ALL.iter().filter(|f| f.kind() == FieldKind::Range) {
            let Some(value) = raw.get(field.name()) else {
                continue;
            };
            match value {
                Value::Object(map) => {
                    for side in ["min", "max"] {
                        if let Some(bound) = map.get(side) {
                            if !is_missing_marker(bound) && number_from_value(bound).is_none() {
                                issues.push(format!("{}.{}: unreadable value {}", field.name(), side, bound));
                            }
                        }
                    }
                }
                other if !is_missing_marker(other) => {
                    if NumericRange::from_value(other).is_missing() {
                        issues.push(format!("{}: unreadable value {}", field.name(), other));
                    }
                }
                _ => {}
            }
        }

        issues.extend(terms.validate());
        Ok((terms, issues))
    }

    /// Consistency checks over parsed values.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for field in SchemaField::ALL.iter().filter(|f| f.kind() == FieldKind::Range) {
            let FieldRef::Range(range) = self.field(*field) else {
                continue;
            };
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    issues.push(format!("{}: min {} exceeds max {}", field.name(), min, max));
                }
            }
            if range.min.is_some_and(|v| v < 0.0) || range.max.is_some_and(|v| v < 0.0) {
                issues.push(format!("{}: negative bound", field.name()));
            }
            if field.is_percentage() && range.max.is_some_and(|v| v > 100.0) {
                issues.push(format!("{}: percentage above 100", field.name()));
            }
        }
        issues
    }

    pub fn field(&self, field: SchemaField) -> FieldRef<'_> {
        use SchemaField::*;
        match field {
            CompanyName => FieldRef::Text(self.company_name.as_deref()),
            LoanPlans => FieldRef::Text(self.loan_plans.as_deref()),
            ServiceAreas => FieldRef::List(&self.service_areas),
            CreditScoreRequirements => FieldRef::Text(self.credit_score_requirements.as_deref()),
            LoanAmount => FieldRef::Range(&self.loan_amount),
            LtvRatio => FieldRef::Range(&self.ltv_ratio),
            ApplicationRequirements => FieldRef::List(&self.application_requirements),
            Guidelines => FieldRef::List(&self.guidelines),
            ContactInformation => FieldRef::Contact(&self.contact_information),
            PropertyTypes => FieldRef::List(&self.property_types),
            InterestRate => FieldRef::Range(&self.interest_rate),
            PointsCharged => FieldRef::Range(&self.points_charged),
            LiquidityRequirements => FieldRef::List(&self.liquidity_requirements),
            LtcRatio => FieldRef::Range(&self.ltc_ratio),
            Dscr => FieldRef::Range(&self.dscr),
            LoanTerm => FieldRef::Range(&self.loan_term),
            Amortization => FieldRef::Text(self.amortization.as_deref()),
            Construction => FieldRef::Flag(self.construction.as_str()),
            ValueAdd => FieldRef::Flag(self.value_add.as_str()),
            PersonalGuarantee => FieldRef::Flag(self.personal_guarantee.as_str()),
        }
    }

    /// Normalised company key used for duplicate detection.
    pub fn company_key(&self) -> Option<String> {
        self.company_name.as_deref().and_then(company_key)
    }
}

/// Lower-cased, punctuation-free company name without trailing entity
/// suffixes, so "Acme Lending, LLC" and "ACME Lending" collide.
pub fn company_key(name: &str) -> Option<String> {
    const SUFFIXES: &[&str] = &[
        "llc", "inc", "incorporated", "corp", "corporation", "co", "company", "ltd", "lp", "llp",
    ];
    let lowered = name.to_lowercase();
    let mut tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| SUFFIXES.contains(t)) {
        tokens.pop();
    }
    if tokens.is_empty() || (tokens.len() == 1 && tokens[0] == "missing") {
        return None;
    }
    Some(tokens.join(" "))
}

// ============================================================================
// Schema fields
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    TextList,
    Regions,
    Range,
    Flag,
    Contact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SchemaField {
    CompanyName,
    LoanPlans,
    ServiceAreas,
    CreditScoreRequirements,
    LoanAmount,
    LtvRatio,
    ApplicationRequirements,
    Guidelines,
    ContactInformation,
    PropertyTypes,
    InterestRate,
    PointsCharged,
    LiquidityRequirements,
    LtcRatio,
    Dscr,
    LoanTerm,
    Amortization,
    Construction,
    ValueAdd,
    PersonalGuarantee,
}

impl SchemaField {
    pub const ALL: [SchemaField; 20] = [
        SchemaField::CompanyName,
        SchemaField::LoanPlans,
        SchemaField::ServiceAreas,
        SchemaField::CreditScoreRequirements,
        SchemaField::LoanAmount,
        SchemaField::LtvRatio,
        SchemaField::ApplicationRequirements,
        SchemaField::Guidelines,
        SchemaField::ContactInformation,
        SchemaField::PropertyTypes,
        SchemaField::InterestRate,
        SchemaField::PointsCharged,
        SchemaField::LiquidityRequirements,
        SchemaField::LtcRatio,
        SchemaField::Dscr,
        SchemaField::LoanTerm,
        SchemaField::Amortization,
        SchemaField::Construction,
        SchemaField::ValueAdd,
        SchemaField::PersonalGuarantee,
    ];

    pub fn name(&self) -> &'static str {
        use SchemaField::*;
        match self {
            CompanyName => "company_name",
            LoanPlans => "loan_plans",
            ServiceAreas => "service_areas",
            CreditScoreRequirements => "credit_score_requirements",
            LoanAmount => "loan_amount",
            LtvRatio => "ltv_ratio",
            ApplicationRequirements => "application_requirements",
            Guidelines => "guidelines",
            ContactInformation => "contact_information",
            PropertyTypes => "property_types",
            InterestRate => "interest_rate",
            PointsCharged => "points_charged",
            LiquidityRequirements => "liquidity_requirements",
            LtcRatio => "ltc_ratio",
            Dscr => "dscr",
            LoanTerm => "loan_term",
            Amortization => "amortization",
            Construction => "construction",
            ValueAdd => "value_add",
            PersonalGuarantee => "personal_guarantee",
        }
    }

    pub fn kind(&self) -> FieldKind {
        use SchemaField::*;
        match self {
            CompanyName | LoanPlans | CreditScoreRequirements | Amortization => FieldKind::Text,
            ServiceAreas => FieldKind::Regions,
            ApplicationRequirements | Guidelines | PropertyTypes | LiquidityRequirements => {
                FieldKind::TextList
            }
            LoanAmount | LtvRatio | InterestRate | PointsCharged | LtcRatio | Dscr | LoanTerm => {
                FieldKind::Range
            }
            Construction | ValueAdd | PersonalGuarantee => FieldKind::Flag,
            ContactInformation => FieldKind::Contact,
        }
    }

    fn is_percentage(&self) -> bool {
        matches!(
            self,
            SchemaField::LtvRatio | SchemaField::LtcRatio | SchemaField::InterestRate | SchemaField::PointsCharged
        )
    }

    /// Resolve a field name, including the aliases models tend to produce.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase().replace([' ', '-', '.'], "_");
        if let Some(field) = Self::ALL.iter().find(|f| f.name() == key) {
            return Some(*field);
        }
        use SchemaField::*;
        Some(match key.as_str() {
            "company" | "lender" | "lender_name" => CompanyName,
            "loan_plan" | "loan_programs" | "programs" => LoanPlans,
            "service_area" | "state" | "states" | "location" | "region" | "regions" => ServiceAreas,
            "credit_score" | "min_credit_score" | "fico" => CreditScoreRequirements,
            "amount" | "loan_size" => LoanAmount,
            "ltv" | "loan_to_value" | "loan_to_value_ratio" => LtvRatio,
            "ltc" | "loan_to_cost" | "loan_to_cost_ratio" => LtcRatio,
            "interest_rates" | "rate" | "rates" => InterestRate,
            "points" | "origination_points" => PointsCharged,
            "debt_service_coverage_ratio" => Dscr,
            "term" | "loan_terms" => LoanTerm,
            "property_type" => PropertyTypes,
            "contact" | "contacts" => ContactInformation,
            "requirements" => ApplicationRequirements,
            "liquidity" => LiquidityRequirements,
            "recourse" | "guarantee" => PersonalGuarantee,
            _ => return None,
        })
    }
}

// ============================================================================
// LoanOffer
// ============================================================================

/// A catalogued offer. `document_id` is the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanOffer {
    pub document_id: String,
    #[serde(flatten)]
    pub terms: OfferTerms,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanOffer {
    pub fn new(document_id: impl Into<String>, terms: OfferTerms, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            document_id: document_id.into(),
            terms,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_number_handles_formats() {
        assert_eq!(normalize_number("$500,000"), Some(500_000.0));
        assert_eq!(normalize_number("75%"), Some(75.0));
        assert_eq!(normalize_number("2.5M"), Some(2_500_000.0));
        assert_eq!(normalize_number("250k"), Some(250_000.0));
        assert_eq!(normalize_number("1.25x"), Some(1.25));
        assert_eq!(normalize_number("MISSING"), None);
        assert_eq!(normalize_number("call us"), None);
    }

    #[test]
    fn test_numeric_range_accepts_shapes() {
        let r: NumericRange = serde_json::from_value(json!({"min": "$100k", "max": 2000000})).unwrap();
        assert_eq!(r, NumericRange::new(Some(100_000.0), Some(2_000_000.0)));

        let r: NumericRange = serde_json::from_value(json!("MISSING")).unwrap();
        assert!(r.is_missing());

        let r: NumericRange = serde_json::from_value(json!("65-75%")).unwrap();
        assert_eq!(r, NumericRange::new(Some(65.0), Some(75.0)));

        let r: NumericRange = serde_json::from_value(json!({"min": "MISSING", "max": 80})).unwrap();
        assert_eq!(r, NumericRange::new(None, Some(80.0)));
    }

    #[test]
    fn test_numeric_range_serializes_missing_sentinel() {
        let r = NumericRange::new(Some(1.0), None);
        assert_eq!(serde_json::to_value(r).unwrap(), json!({"min": 1.0, "max": "MISSING"}));
    }

    #[test]
    fn test_offer_terms_lenient_decode() {
        let raw = json!({
            "company_name": "Acme Capital",
            "service_areas": "California, tx, Nevada",
            "loan_amount": {"min": "$250,000", "max": "5M"},
            "guidelines": "No owner-occupied loans",
            "construction": "Yes",
            "value_add": true,
            "personal_guarantee": "partial",
            "amortization": "MISSING",
            "contact_information": {"person": "Jo Park", "phone": "MISSING"}
        });
        let terms: OfferTerms = serde_json::from_value(raw).unwrap();
        assert_eq!(terms.company_name.as_deref(), Some("Acme Capital"));
        assert_eq!(terms.service_areas, vec!["CA", "TX", "NV"]);
        assert_eq!(terms.loan_amount, NumericRange::new(Some(250_000.0), Some(5_000_000.0)));
        assert_eq!(terms.guidelines, vec!["No owner-occupied loans"]);
        assert_eq!(terms.construction, TriState::Yes);
        assert_eq!(terms.value_add, TriState::Yes);
        assert_eq!(terms.personal_guarantee, Guarantee::Partial);
        assert_eq!(terms.amortization, None);
        assert_eq!(terms.contact_information.phone, None);
        assert_eq!(terms.dscr, NumericRange::default());
    }

    #[test]
    fn test_offer_terms_round_trip_with_sentinels() {
        let terms = OfferTerms {
            company_name: Some("Acme".into()),
            service_areas: vec!["CA".into()],
            loan_amount: NumericRange::new(Some(1.0), None),
            ..Default::default()
        };
        let json = serde_json::to_value(&terms).unwrap();
        assert_eq!(json["amortization"], MISSING);
        assert_eq!(json["construction"], MISSING);
        let back: OfferTerms = serde_json::from_value(json).unwrap();
        assert_eq!(back, terms);
    }

    #[test]
    fn test_conform_flags_unreadable_bounds() {
        let raw = json!({
            "company_name": "Acme",
            "loan_amount": {"min": "call for pricing", "max": 1000000},
            "ltv_ratio": {"min": 90, "max": 70},
            "dscr": "MISSING"
        });
        let (terms, issues) = OfferTerms::conform(&raw).unwrap();
        assert_eq!(terms.loan_amount.min, None);
        assert_eq!(terms.loan_amount.max, Some(1_000_000.0));
        assert!(issues.iter().any(|i| i.starts_with("loan_amount.min")));
        assert!(issues.iter().any(|i| i.contains("ltv_ratio: min 90 exceeds max 70")));
        assert!(!issues.iter().any(|i| i.starts_with("dscr")));
    }

    #[test]
    fn test_company_key_normalises_suffixes() {
        assert_eq!(company_key("Acme Lending, LLC").as_deref(), Some("acme lending"));
        assert_eq!(company_key("ACME  lending").as_deref(), Some("acme lending"));
        assert_eq!(company_key("MISSING"), None);
        assert_eq!(company_key(" , "), None);
    }

    #[test]
    fn test_schema_field_aliases() {
        assert_eq!(SchemaField::parse("interest_rates"), Some(SchemaField::InterestRate));
        assert_eq!(SchemaField::parse("service_area"), Some(SchemaField::ServiceAreas));
        assert_eq!(SchemaField::parse("loan_to_value_ratio"), Some(SchemaField::LtvRatio));
        assert_eq!(SchemaField::parse("Loan Amount"), Some(SchemaField::LoanAmount));
        assert_eq!(SchemaField::parse("favourite_colour"), None);
        for field in SchemaField::ALL {
            assert_eq!(SchemaField::parse(field.name()), Some(field));
        }
    }
}
