//! Compiled store predicates.
//!
//! A [`StorePredicate`] is the backend-neutral form of a user's filters: a
//! conjunction of [`Condition`]s over offer fields. It can be evaluated
//! in-process against [`OfferTerms`] or rendered into SQL over the
//! `loan_offers.terms` JSONB column. Both renderings agree: a missing value
//! never satisfies a comparison.

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};

use crate::models::{FieldRef, NumericRange, OfferTerms, SchemaField};

/// Which side of a numeric range a comparison reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSide {
    Min,
    Max,
}

impl RangeSide {
    fn key(&self) -> &'static str {
        match self {
            RangeSide::Min => "min",
            RangeSide::Max => "max",
        }
    }

    fn read(&self, range: &NumericRange) -> Option<f64> {
        match self {
            RangeSide::Min => range.min,
            RangeSide::Max => range.max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn sql(&self) -> &'static str {
        match self {
            Comparison::Gt => " > ",
            Comparison::Gte => " >= ",
            Comparison::Lt => " < ",
            Comparison::Lte => " <= ",
        }
    }

    fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Gt => lhs > rhs,
            Comparison::Gte => lhs >= rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Lte => lhs <= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Exact equality with the whole value (or any list element), ignoring
    /// surrounding whitespace.
    TextEquals { field: SchemaField, value: String },
    /// Case-insensitive substring.
    TextContains { field: SchemaField, needle: String },
    /// Case-insensitive prefix.
    TextPrefix { field: SchemaField, prefix: String },
    /// Any of the words as a case-insensitive substring.
    TextAnyWord { field: SchemaField, words: Vec<String> },
    /// Offer serves at least one of the region codes.
    RegionIn { codes: Vec<String> },
    /// One bound of a range field compared to a constant.
    RangeBound {
        field: SchemaField,
        side: RangeSide,
        cmp: Comparison,
        value: f64,
    },
    /// A yes/no/partial flag equals the given value.
    FlagIs { field: SchemaField, value: String },
}

impl Condition {
    pub fn field(&self) -> SchemaField {
        match self {
            Condition::TextEquals { field, .. }
            | Condition::TextContains { field, .. }
            | Condition::TextPrefix { field, .. }
            | Condition::TextAnyWord { field, .. }
            | Condition::RangeBound { field, .. }
            | Condition::FlagIs { field, .. } => *field,
            Condition::RegionIn { .. } => SchemaField::ServiceAreas,
        }
    }

    pub fn matches(&self, terms: &OfferTerms) -> bool {
        match self {
            Condition::TextEquals { field, value } => {
                let value = value.trim();
                texts(terms, *field).any(|t| t.trim() == value)
            }
            Condition::TextContains { field, needle } => {
                let needle = needle.to_lowercase();
                texts(terms, *field).any(|t| t.to_lowercase().contains(&needle))
            }
            Condition::TextPrefix { field, prefix } => {
                let prefix = prefix.to_lowercase();
                texts(terms, *field).any(|t| t.to_lowercase().starts_with(&prefix))
            }
            Condition::TextAnyWord { field, words } => {
                let words: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
                texts(terms, *field).any(|t| {
                    let t = t.to_lowercase();
                    words.iter().any(|w| t.contains(w))
                })
            }
            Condition::RegionIn { codes } => terms.service_areas.iter().any(|a| codes.contains(a)),
            Condition::RangeBound { field, side, cmp, value } => match terms.field(*field) {
                FieldRef::Range(range) => side.read(range).is_some_and(|bound| cmp.holds(bound, *value)),
                _ => false,
            },
            Condition::FlagIs { field, value } => {
                matches!(terms.field(*field), FieldRef::Flag(flag) if flag == value.as_str())
            }
        }
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Condition::TextEquals { field, value } => {
                push_text_test(qb, *field, "btrim(v) = ", value.trim().to_string(), "");
            }
            Condition::TextContains { field, needle } => {
                push_text_test(qb, *field, "v ILIKE ", format!("%{}%", escape_like(needle)), "");
            }
            Condition::TextPrefix { field, prefix } => {
                push_text_test(qb, *field, "v ILIKE ", format!("{}%", escape_like(prefix)), "");
            }
            Condition::TextAnyWord { field, words } => {
                qb.push("(");
                for (i, word) in words.iter().enumerate() {
                    if i > 0 {
                        qb.push(" OR ");
                    }
                    push_text_test(qb, *field, "v ILIKE ", format!("%{}%", escape_like(word)), "");
                }
                if words.is_empty() {
                    qb.push("FALSE");
                }
                qb.push(")");
            }
            Condition::RegionIn { codes } => {
                qb.push("(CASE WHEN jsonb_typeof(terms->'service_areas') = 'array' THEN terms->'service_areas' ELSE '[]'::jsonb END ?| ");
                qb.push_bind(codes.clone());
                qb.push("::text[])");
            }
            Condition::RangeBound { field, side, cmp, value } => {
                let name = field.name();
                let key = side.key();
                qb.push(format!(
                    "(CASE WHEN jsonb_typeof(terms->'{name}'->'{key}') = 'number' THEN (terms->'{name}'->>'{key}')::float8 END)"
                ));
                qb.push(cmp.sql());
                qb.push_bind(*value);
            }
            Condition::FlagIs { field, value } => {
                qb.push(format!("(terms->>'{}') = ", field.name()));
                qb.push_bind(value.clone());
            }
        }
    }
}

/// Every text value of a field: the scalar, each list element, or each contact part.
fn texts<'a>(terms: &'a OfferTerms, field: SchemaField) -> Box<dyn Iterator<Item = &'a str> + 'a> {
    match terms.field(field) {
        FieldRef::Text(t) => Box::new(t.into_iter()),
        FieldRef::List(items) => Box::new(items.iter().map(String::as_str)),
        FieldRef::Contact(c) => Box::new(c.parts()),
        FieldRef::Flag(_) | FieldRef::Range(_) => Box::new(std::iter::empty()),
    }
}

/// Text values of a field as an SQL set named `e(v)`.
fn text_source(field: SchemaField) -> String {
    let name = field.name();
    match field {
        SchemaField::ContactInformation => format!(
            "(SELECT terms->'{name}'->>'person' AS v UNION ALL SELECT terms->'{name}'->>'phone' UNION ALL SELECT terms->'{name}'->>'email') AS e"
        ),
        _ => format!(
            "jsonb_array_elements_text(CASE jsonb_typeof(terms->'{name}') \
             WHEN 'array' THEN terms->'{name}' \
             WHEN 'string' THEN jsonb_build_array(terms->'{name}') \
             ELSE '[]'::jsonb END) AS e(v)"
        ),
    }
}

fn push_text_test(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: SchemaField,
    lhs: &str,
    bind: String,
    close: &str,
) {
    qb.push(format!("EXISTS (SELECT 1 FROM {} WHERE v IS NOT NULL AND v <> 'MISSING' AND ", text_source(field)));
    qb.push(lhs);
    qb.push_bind(bind);
    if lhs.contains("ILIKE") {
        qb.push(" ESCAPE '\\'");
    }
    qb.push(close);
    qb.push(")");
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Conjunction of conditions, in filter order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorePredicate {
    pub conditions: Vec<Condition>,
}

impl StorePredicate {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, terms: &OfferTerms) -> bool {
        self.conditions.iter().all(|c| c.matches(terms))
    }

    /// Append ` WHERE ...` to `qb`, or nothing for an empty predicate.
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        for (i, condition) in self.conditions.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            condition.push_sql(qb);
        }
    }
}
