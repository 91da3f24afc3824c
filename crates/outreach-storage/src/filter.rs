//! Audience filter expressions
//!
//! A campaign audience filter arrives as JSON (`FilterExpression`). It is
//! compiled once into a [`RecipientFilter`], which can either evaluate a
//! recipient in memory or append an equivalent parameterised `WHERE`
//! fragment to a Postgres query. Both paths must agree on every operator.

use outreach_common::types::AccountId;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;

use crate::models::{value_to_text, Recipient};

/// Prefixes that route a field name into the custom-field map
const CUSTOM_FIELD_PREFIXES: [&str; 3] = ["custom.", "customFields.", "custom_fields."];

/// SQL pattern mirroring [`parse_number`]
const NUMERIC_PATTERN: &str = r"^\s*-?[0-9]+(\.[0-9]+)?\s*$";

/// Filter expression as stored on the campaign
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterExpression {
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Recipient must carry at least one of these tags
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

/// A single field comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "lt")]
    LessThan,
}

#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("Unknown filter field: {0}")]
    UnknownField(String),

    #[error("Unsupported value for field {field}: expected a scalar")]
    InvalidValue { field: String },
}

/// Recipient attribute a predicate reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Name,
    Phone,
    Email,
    Custom(String),
}

impl FieldRef {
    pub fn parse(field: &str) -> Result<Self, FilterError> {
        for prefix in CUSTOM_FIELD_PREFIXES {
            if let Some(key) = field.strip_prefix(prefix) {
                if key.is_empty() {
                    break;
                }
                return Ok(FieldRef::Custom(key.to_string()));
            }
        }

        match field.to_ascii_lowercase().as_str() {
            "name" => Ok(FieldRef::Name),
            "phone" | "phone_number" => Ok(FieldRef::Phone),
            "email" => Ok(FieldRef::Email),
            _ => Err(FilterError::UnknownField(field.to_string())),
        }
    }

    /// Current value of this field on `recipient`, as text
    pub fn value_of(&self, recipient: &Recipient) -> Option<String> {
        match self {
            FieldRef::Name => recipient.name.clone(),
            FieldRef::Phone => Some(recipient.phone.clone()),
            FieldRef::Email => recipient.email.clone(),
            FieldRef::Custom(key) => recipient.custom_field(key).map(value_to_text),
        }
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            FieldRef::Name => {
                qb.push("name");
            }
            FieldRef::Phone => {
                qb.push("phone");
            }
            FieldRef::Email => {
                qb.push("email");
            }
            FieldRef::Custom(key) => {
                qb.push("(custom_fields ->> ");
                qb.push_bind(key.clone());
                qb.push(")");
            }
        }
    }
}

/// Compiled condition
#[derive(Debug, Clone)]
pub struct Predicate {
    field: FieldRef,
    operator: FilterOperator,
    value: String,
    number: Option<f64>,
}

impl Predicate {
    fn compile(condition: &Condition) -> Result<Self, FilterError> {
        let field = FieldRef::parse(&condition.field)?;
        if condition.value.is_object() || condition.value.is_array() {
            return Err(FilterError::InvalidValue {
                field: condition.field.clone(),
            });
        }

        let value = value_to_text(&condition.value);
        let number = parse_number(&value);

        Ok(Self {
            field,
            operator: condition.operator,
            value,
            number,
        })
    }

    fn matches(&self, recipient: &Recipient) -> bool {
        let actual = self.field.value_of(recipient);
        let actual_lower = actual.as_deref().map(str::to_lowercase);
        let expected = self.value.to_lowercase();

        match self.operator {
            FilterOperator::Equals => actual_lower.as_deref() == Some(expected.as_str()),
            FilterOperator::NotEquals => actual_lower.as_deref() != Some(expected.as_str()),
            FilterOperator::Contains => actual_lower.is_some_and(|a| a.contains(&expected)),
            FilterOperator::NotContains => !actual_lower.is_some_and(|a| a.contains(&expected)),
            FilterOperator::StartsWith => actual_lower.is_some_and(|a| a.starts_with(&expected)),
            FilterOperator::EndsWith => actual_lower.is_some_and(|a| a.ends_with(&expected)),
            FilterOperator::GreaterThan => self.compare(actual.as_deref(), |a, b| a > b),
            FilterOperator::LessThan => self.compare(actual.as_deref(), |a, b| a < b),
        }
    }

    fn compare(&self, actual: Option<&str>, op: impl Fn(f64, f64) -> bool) -> bool {
        match (actual.and_then(parse_number), self.number) {
            (Some(a), Some(b)) => op(a, b),
            _ => false,
        }
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self.operator {
            FilterOperator::Equals => {
                qb.push("lower(");
                self.field.push_sql(qb);
                qb.push(") = lower(");
                qb.push_bind(self.value.clone());
                qb.push(")");
            }
            FilterOperator::NotEquals => {
                qb.push("lower(");
                self.field.push_sql(qb);
                qb.push(") IS DISTINCT FROM lower(");
                qb.push_bind(self.value.clone());
                qb.push(")");
            }
            FilterOperator::Contains | FilterOperator::NotContains => {
                if self.operator == FilterOperator::NotContains {
                    qb.push("NOT ");
                }
                qb.push("COALESCE(strpos(lower(");
                self.field.push_sql(qb);
                qb.push("), lower(");
                qb.push_bind(self.value.clone());
                qb.push(")) > 0, FALSE)");
            }
            FilterOperator::StartsWith => {
                qb.push("COALESCE(starts_with(lower(");
                self.field.push_sql(qb);
                qb.push("), lower(");
                qb.push_bind(self.value.clone());
                qb.push(")), FALSE)");
            }
            FilterOperator::EndsWith => {
                qb.push("COALESCE(right(lower(");
                self.field.push_sql(qb);
                qb.push("), ");
                qb.push_bind(self.value.chars().count() as i32);
                qb.push(") = lower(");
                qb.push_bind(self.value.clone());
                qb.push("), FALSE)");
            }
            FilterOperator::GreaterThan | FilterOperator::LessThan => {
                let Some(number) = self.number else {
                    qb.push("FALSE");
                    return;
                };
                let op = if self.operator == FilterOperator::GreaterThan {
                    " > "
                } else {
                    " < "
                };
                qb.push("CASE WHEN ");
                self.field.push_sql(qb);
                qb.push(" ~ ");
                qb.push_bind(NUMERIC_PATTERN);
                qb.push(" THEN (");
                self.field.push_sql(qb);
                qb.push(")::float8");
                qb.push(op);
                qb.push_bind(number);
                qb.push(" ELSE FALSE END");
            }
        }
    }
}

/// Compiled audience filter, scoped to one owner
#[derive(Debug, Clone)]
pub struct RecipientFilter {
    pub owner_id: AccountId,
    combinator: Combinator,
    predicates: Vec<Predicate>,
    tags: Vec<String>,
}

impl RecipientFilter {
    pub fn compile(owner_id: AccountId, expression: &FilterExpression) -> Result<Self, FilterError> {
        let predicates = expression
            .conditions
            .iter()
            .map(Predicate::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            owner_id,
            combinator: expression.combinator,
            predicates,
            tags: expression
                .tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        })
    }

    /// Evaluate against a single recipient
    pub fn matches(&self, recipient: &Recipient) -> bool {
        if recipient.owner_id != self.owner_id || !recipient.opted_in {
            return false;
        }
        if !self.tags.is_empty() && !recipient.has_any_tag(&self.tags) {
            return false;
        }
        if self.predicates.is_empty() {
            return true;
        }

        match self.combinator {
            Combinator::And => self.predicates.iter().all(|p| p.matches(recipient)),
            Combinator::Or => self.predicates.iter().any(|p| p.matches(recipient)),
        }
    }

    /// Append `WHERE ...` for the `recipients` table
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" WHERE owner_id = ");
        qb.push_bind(self.owner_id);
        qb.push(" AND opted_in = TRUE");

        if !self.tags.is_empty() {
            let lowered: Vec<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
            qb.push(" AND EXISTS (SELECT 1 FROM unnest(tags) AS t WHERE lower(t) = ANY(");
            qb.push_bind(lowered);
            qb.push("))");
        }

        if self.predicates.is_empty() {
            return;
        }

        let joiner = match self.combinator {
            Combinator::And => " AND ",
            Combinator::Or => " OR ",
        };

        qb.push(" AND (");
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                qb.push(joiner);
            }
            qb.push("(");
            predicate.push_sql(qb);
            qb.push(")");
        }
        qb.push(")");
    }
}

/// Parse a plain decimal number (`-12`, `3.5`); anything else is not numeric
fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let unsigned = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let (int, frac) = match unsigned.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (unsigned, None),
    };

    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int) || !frac.map_or(true, all_digits) {
        return None;
    }
    trimmed.parse().ok()
}
