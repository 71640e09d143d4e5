//! Natural-language filters and their compilation into store predicates.
//!
//! `extract_filters` asks the model for `{field, operator, value}` triples
//! over the declared offer fields. `compile` turns those into a
//! [`StorePredicate`] with fixed, field-specific rules and never fails:
//! anything it cannot express is logged and dropped.

use lendscope_core::completion::complete_structured;
use lendscope_core::models::regions::{canonical_region, state_name};
use lendscope_core::models::session::recent_turns;
use lendscope_core::models::{normalize_number, ConversationTurn, FieldKind, Guarantee, SchemaField, TriState, MISSING};
use lendscope_core::predicate::{Comparison, RangeSide};
use lendscope_core::{CompletionGateway, Condition, StorePredicate, StructuredOutput};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::intent::HISTORY_LIMIT;

/// One filter as produced by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Filter {
    pub field: String,
    pub operator: String,
    pub value: Value,
}

impl Filter {
    pub fn new(field: &str, operator: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FilterExtraction {
    #[serde(default)]
    filters: Vec<Filter>,
}

impl StructuredOutput for FilterExtraction {
    const SCHEMA_NAME: &'static str = "filter_extraction";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Contains,
    StartsWith,
    TextSearch,
    Gt,
    Lt,
    Gte,
    Lte,
    Between,
    Range,
}

impl Operator {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" | "equals" => Operator::Eq,
            "contains" => Operator::Contains,
            "startswith" | "starts_with" => Operator::StartsWith,
            "textsearch" | "text_search" | "search" => Operator::TextSearch,
            ">" | "gt" => Operator::Gt,
            "<" | "lt" => Operator::Lt,
            ">=" | "gte" => Operator::Gte,
            "<=" | "lte" => Operator::Lte,
            "between" => Operator::Between,
            "range" => Operator::Range,
            _ => return None,
        })
    }
}

fn filter_prompt() -> String {
    let fields: Vec<&str> = SchemaField::ALL.iter().map(SchemaField::name).collect();
    format!(
        "You turn a borrower's request into search filters over a lender catalog.\n\
         Allowed fields: {}.\n\
         Allowed operators: =, contains, startswith, textsearch, >, <, >=, <=, between, range.\n\
         - Use only criteria the user actually stated in the latest message or earlier in the conversation. \
         Never infer or invent filters.\n\
         - Numbers are plain values: 500k becomes 500000, 75% becomes 75.\n\
         - `between` and `range` take a two-element array [low, high].\n\
         - `service_areas` values are two-letter US state codes; several states go in one comma-separated value.\n\
         - construction and value_add take yes or no; personal_guarantee takes yes, no or partial.\n\
         Return an empty list when there are no usable criteria.",
        fields.join(", ")
    )
}

/// Extract filters from the conversation. Any failure yields no filters.
pub async fn extract_filters(
    gateway: &dyn CompletionGateway,
    history: &[ConversationTurn],
    message: &str,
) -> Vec<Filter> {
    let mut turns = recent_turns(history, HISTORY_LIMIT).to_vec();
    turns.push(ConversationTurn::user(message));

    match complete_structured::<FilterExtraction>(gateway, &filter_prompt(), &turns).await {
        Ok(extraction) => {
            tracing::debug!(count = extraction.filters.len(), "Filters extracted");
            extraction.filters
        }
        Err(e) => {
            tracing::warn!(error = %e, "Filter extraction failed, continuing without filters");
            Vec::new()
        }
    }
}

/// Compile filters into a conjunctive predicate.
///
/// A later filter on a field replaces any earlier one on the same field.
/// Filters that do not compile are dropped and do not replace anything.
pub fn compile(filters: &[Filter]) -> StorePredicate {
    let mut by_field: Vec<(SchemaField, Vec<Condition>)> = Vec::new();

    for filter in filters {
        match compile_one(filter) {
            Ok((field, conditions)) => {
                if let Some(pos) = by_field.iter().position(|(f, _)| *f == field) {
                    tracing::debug!(field = field.name(), "Later filter replaces earlier one");
                    by_field.remove(pos);
                }
                by_field.push((field, conditions));
            }
            Err(reason) => {
                tracing::warn!(
                    field = %filter.field,
                    operator = %filter.operator,
                    value = %filter.value,
                    reason,
                    "Filter dropped"
                );
            }
        }
    }

    StorePredicate {
        conditions: by_field.into_iter().flat_map(|(_, c)| c).collect(),
    }
}

fn compile_one(filter: &Filter) -> Result<(SchemaField, Vec<Condition>), &'static str> {
    let field = SchemaField::parse(&filter.field).ok_or("unknown field")?;
    let op = Operator::parse(&filter.operator).ok_or("unknown operator")?;
    let conditions = match field.kind() {
        FieldKind::Text | FieldKind::TextList | FieldKind::Contact => text_conditions(field, op, &filter.value)?,
        FieldKind::Regions => region_conditions(op, &filter.value)?,
        FieldKind::Range => range_conditions(field, op, &filter.value)?,
        FieldKind::Flag => flag_conditions(field, op, &filter.value)?,
    };
    Ok((field, conditions))
}

fn text_conditions(field: SchemaField, op: Operator, value: &Value) -> Result<Vec<Condition>, &'static str> {
    let text = value_text(value).ok_or("value is not text")?;
    let condition = match op {
        Operator::Eq => Condition::TextEquals { field, value: text },
        Operator::Contains => Condition::TextContains { field, needle: text },
        Operator::StartsWith => Condition::TextPrefix { field, prefix: text },
        Operator::TextSearch => {
            let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
            Condition::TextAnyWord { field, words }
        }
        _ => return Err("operator not valid for a text field"),
    };
    Ok(vec![condition])
}

fn region_conditions(op: Operator, value: &Value) -> Result<Vec<Condition>, &'static str> {
    let parts: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(value_text).collect(),
        other => {
            let text = value_text(other).ok_or("value is not text")?;
            text.split(',').map(str::to_string).collect()
        }
    };

    let mut codes: Vec<String> = Vec::new();
    match op {
        Operator::Eq | Operator::Contains | Operator::TextSearch => {
            for part in &parts {
                for code in region_codes(part, op == Operator::TextSearch) {
                    if !codes.contains(&code) {
                        codes.push(code);
                    }
                }
            }
        }
        _ => return Err("operator not valid for service_areas"),
    }

    if codes.is_empty() {
        return Err("no region in value");
    }
    Ok(vec![Condition::RegionIn { codes }])
}

/// A whole part that names a state wins; free text searches split into words.
fn region_codes(part: &str, split_words: bool) -> Vec<String> {
    let Some(code) = canonical_region(part) else {
        return Vec::new();
    };
    if state_name(&code).is_some() || !split_words {
        return vec![code];
    }
    part.split_whitespace()
        .filter_map(canonical_region)
        .collect()
}

fn range_conditions(field: SchemaField, op: Operator, value: &Value) -> Result<Vec<Condition>, &'static str> {
    let bound = |side: RangeSide, cmp: Comparison, value: f64| Condition::RangeBound { field, side, cmp, value };

    Ok(match op {
        // Thresholds ask whether the offer reaches the value.
        Operator::Gt => vec![bound(RangeSide::Max, Comparison::Gt, value_number(value)?)],
        Operator::Gte => vec![bound(RangeSide::Max, Comparison::Gte, value_number(value)?)],
        Operator::Lt => vec![bound(RangeSide::Min, Comparison::Lt, value_number(value)?)],
        Operator::Lte => vec![bound(RangeSide::Min, Comparison::Lte, value_number(value)?)],
        Operator::Eq => {
            let v = value_number(value)?;
            vec![
                bound(RangeSide::Min, Comparison::Lte, v),
                bound(RangeSide::Max, Comparison::Gte, v),
            ]
        }
        Operator::Between => {
            let (lo, hi) = value_bounds(value)?;
            vec![
                bound(RangeSide::Min, Comparison::Lte, hi),
                bound(RangeSide::Max, Comparison::Gte, lo),
            ]
        }
        Operator::Range => {
            let (lo, hi) = value_bounds(value)?;
            vec![
                bound(RangeSide::Min, Comparison::Gte, lo),
                bound(RangeSide::Max, Comparison::Lte, hi),
            ]
        }
        _ => return Err("operator not valid for a range field"),
    })
}

fn flag_conditions(field: SchemaField, op: Operator, value: &Value) -> Result<Vec<Condition>, &'static str> {
    if !matches!(op, Operator::Eq | Operator::Contains) {
        return Err("operator not valid for a flag field");
    }
    let raw = match value {
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        other => value_text(other).ok_or("value is not text")?,
    };
    let flag = match field {
        SchemaField::PersonalGuarantee => Guarantee::parse(&raw).as_str(),
        _ => TriState::parse(&raw).as_str(),
    };
    if flag == MISSING {
        return Err("unrecognised flag value");
    }
    Ok(vec![Condition::FlagIs {
        field,
        value: flag.to_string(),
    }])
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().filter_map(value_text).collect::<Vec<_>>().join(" "),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn value_number(value: &Value) -> Result<f64, &'static str> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => normalize_number(s),
        Value::Array(items) if items.len() == 1 => return value_number(&items[0]),
        _ => None,
    }
    .ok_or("value is not a number")
}

/// Two bounds from `[lo, hi]`, `{min, max}` or `"lo-hi"`, ordered.
fn value_bounds(value: &Value) -> Result<(f64, f64), &'static str> {
    let (a, b) = match value {
        Value::Array(items) if items.len() == 2 => (value_number(&items[0])?, value_number(&items[1])?),
        Value::Object(map) => (
            map.get("min").ok_or("missing min").and_then(value_number)?,
            map.get("max").ok_or("missing max").and_then(value_number)?,
        ),
        Value::String(s) => {
            let parts: Vec<&str> = s.split(|c: char| c == '-' || c == ',').map(str::trim).collect();
            match parts.as_slice() {
                [a, b] => (
                    normalize_number(a).ok_or("value is not a number")?,
                    normalize_number(b).ok_or("value is not a number")?,
                ),
                _ => return Err("value is not a two-element range"),
            }
        }
        _ => return Err("value is not a two-element range"),
    };
    Ok((a.min(b), a.max(b)))
}
