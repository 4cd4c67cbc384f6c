// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL Translator
//!
//! Pushes lookup predicates down to the source store as a parameterized
//! WHERE clause over the model's table.
//!
//! # SQL Syntax Generated
//!
//! ```sql
//! status = ?                          -- exact
//! owner_id = ?                        -- exact on a foreign key
//! LOWER(status) LIKE ? ESCAPE '!'     -- icontains / istartswith / iendswith (MySQL)
//! created BETWEEN ? AND ?             -- range
//! status IN (?, ?, ?)                 -- in
//! due IS NULL                         -- isnull / exact null
//! ```
//!
//! Only direct-field predicates whose SQL form is at least as permissive as
//! the in-process matcher are translated; the rest are left out and the caller
//! re-checks every fetched row. Relation hops, many-to-many and JSON fields,
//! and every decimal comparison stay client-side (decimals are stored as text).
//! Case-insensitive text lookups stay client-side on SQLite, whose `LOWER`
//! and `LIKE` fold ASCII only, and for non-ASCII operands everywhere.

use chrono::SecondsFormat;
use serde_json::Value;

use super::lookup::{LookupOp, LookupPredicate};
use super::matcher::{parse_date, parse_datetime};
use crate::schema::{FieldDef, FieldType, ModelSchema};

/// SQL predicate translator.
pub struct SqlTranslator;

/// WHERE clause (without the keyword) and its parameters, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub clause: String,
    pub params: Vec<SqlParam>,
    /// Number of predicates left to the caller.
    pub residual: usize,
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Numeric(f64),
}

/// Target database, for the predicates whose semantics differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    MySql,
}

impl SqlDialect {
    fn folds_case(self, operand: &str) -> bool {
        self == Self::MySql && operand.is_ascii()
    }
}

const LIKE_ESCAPE: char = '!';

/// Column holding a field: `{field}_id` for foreign keys, the field name
/// otherwise. Many-to-many fields live in link tables and have none.
pub(crate) fn column_name(field: &FieldDef) -> Option<String> {
    match field.field_type {
        FieldType::ForeignKey(_) => Some(format!("{}_id", field.name)),
        FieldType::ManyToMany(_) => None,
        _ => Some(field.name.clone()),
    }
}

/// Canonical text form for datetimes stored in the source table.
pub(crate) fn datetime_column_text(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqlTranslator {
    /// Translate predicates to a parameterized WHERE clause (`?` placeholders).
    pub fn translate(
        dialect: SqlDialect,
        schema: &ModelSchema,
        predicates: &[LookupPredicate],
    ) -> SqlQuery {
        let mut params = Vec::new();
        let mut parts = Vec::new();
        let mut residual = 0;

        for predicate in predicates {
            match Self::translate_predicate(dialect, schema, predicate, &mut params) {
                Some(part) => parts.push(part),
                None => residual += 1,
            }
        }

        let clause = match parts.len() {
            0 => "1=1".to_string(),
            1 => parts.remove(0),
            _ => format!("({})", parts.join(" AND ")),
        };
        SqlQuery {
            clause,
            params,
            residual,
        }
    }

    /// Translate with inline values.
    ///
    /// Warning: Only use for debugging, not for actual queries (SQL injection risk)
    pub fn translate_inline(
        dialect: SqlDialect,
        schema: &ModelSchema,
        predicates: &[LookupPredicate],
    ) -> String {
        let query = Self::translate(dialect, schema, predicates);
        let mut result = query.clause;
        for param in query.params {
            let value = match param {
                SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
                SqlParam::Integer(n) => n.to_string(),
                SqlParam::Numeric(n) => n.to_string(),
            };
            result = result.replacen('?', &value, 1);
        }
        result
    }

    fn translate_predicate(
        dialect: SqlDialect,
        schema: &ModelSchema,
        predicate: &LookupPredicate,
        params: &mut Vec<SqlParam>,
    ) -> Option<String> {
        if predicate.path.is_hop() {
            return None;
        }
        let field = schema.field(&predicate.path.field)?;
        if matches!(field.field_type, FieldType::Json | FieldType::Decimal) {
            return None;
        }
        let column = column_name(field)?;
        let ty = &field.field_type;

        match predicate.op {
            LookupOp::IsNull => {
                let want_null = predicate.value.as_bool()?;
                Some(if want_null {
                    format!("{} IS NULL", column)
                } else {
                    format!("{} IS NOT NULL", column)
                })
            }
            LookupOp::Exact if predicate.value.is_null() => Some(format!("{} IS NULL", column)),
            LookupOp::Exact => {
                params.push(to_param(ty, &predicate.value)?);
                Some(format!("{} = ?", column))
            }
            LookupOp::In => {
                let items = predicate.value.as_array()?;
                let values: Vec<SqlParam> = items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| to_param(ty, v))
                    .collect::<Option<_>>()?;
                if values.is_empty() {
                    return Some("1=0".to_string());
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values);
                Some(format!("{} IN ({})", column, placeholders))
            }
            LookupOp::Gt | LookupOp::Gte | LookupOp::Lt | LookupOp::Lte => {
                if !ty.is_ordered() {
                    return None;
                }
                params.push(to_param(ty, &predicate.value)?);
                let symbol = match predicate.op {
                    LookupOp::Gt => ">",
                    LookupOp::Gte => ">=",
                    LookupOp::Lt => "<",
                    _ => "<=",
                };
                Some(format!("{} {} ?", column, symbol))
            }
            LookupOp::Range => {
                if !ty.is_ordered() {
                    return None;
                }
                let (low, high) = match predicate.value.as_array()?.as_slice() {
                    [low, high] => (to_param(ty, low)?, to_param(ty, high)?),
                    _ => return None,
                };
                params.push(low);
                params.push(high);
                Some(format!("{} BETWEEN ? AND ?", column))
            }
            LookupOp::IExact => {
                let text = text_operand(ty, &predicate.value)?;
                if !dialect.folds_case(text) {
                    return None;
                }
                params.push(SqlParam::Text(text.to_lowercase()));
                Some(format!("LOWER({}) = ?", column))
            }
            LookupOp::Contains
            | LookupOp::IContains
            | LookupOp::StartsWith
            | LookupOp::IStartsWith
            | LookupOp::EndsWith
            | LookupOp::IEndsWith => {
                let text = text_operand(ty, &predicate.value)?;
                let escaped = escape_like(text);
                let pattern = match predicate.op {
                    LookupOp::Contains | LookupOp::IContains => format!("%{}%", escaped),
                    LookupOp::StartsWith | LookupOp::IStartsWith => format!("{}%", escaped),
                    _ => format!("%{}", escaped),
                };
                let case_insensitive = matches!(
                    predicate.op,
                    LookupOp::IContains | LookupOp::IStartsWith | LookupOp::IEndsWith
                );
                if case_insensitive && !dialect.folds_case(text) {
                    return None;
                }
                if case_insensitive {
                    params.push(SqlParam::Text(pattern.to_lowercase()));
                    Some(format!("LOWER({}) LIKE ? ESCAPE '{}'", column, LIKE_ESCAPE))
                } else {
                    params.push(SqlParam::Text(pattern));
                    Some(format!("{} LIKE ? ESCAPE '{}'", column, LIKE_ESCAPE))
                }
            }
        }
    }
}

fn text_operand<'a>(ty: &FieldType, value: &'a Value) -> Option<&'a str> {
    match ty {
        FieldType::Text => value.as_str(),
        _ => None,
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

fn to_param(ty: &FieldType, value: &Value) -> Option<SqlParam> {
    match ty {
        FieldType::Integer => match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .map(SqlParam::Integer),
        FieldType::Float => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .map(SqlParam::Numeric),
        FieldType::Text => match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
        .map(SqlParam::Text),
        FieldType::Boolean => value.as_bool().map(|b| SqlParam::Integer(i64::from(b))),
        FieldType::DateTime => value
            .as_str()
            .and_then(parse_datetime)
            .map(|dt| SqlParam::Text(datetime_column_text(&dt))),
        FieldType::Date => value
            .as_str()
            .and_then(parse_date)
            .map(|d| SqlParam::Text(d.format("%Y-%m-%d").to_string())),
        FieldType::ForeignKey(_) => crate::record::RecordId::from_value(value).map(|id| SqlParam::Integer(id.0)),
        FieldType::Decimal | FieldType::Json | FieldType::ManyToMany(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ModelSchema {
        ModelSchema::new("Task")
            .with_field(FieldDef::new("status", FieldType::Text))
            .with_field(FieldDef::new("points", FieldType::Integer))
            .with_field(FieldDef::new("price", FieldType::Decimal))
            .with_field(FieldDef::new("done", FieldType::Boolean))
            .with_field(FieldDef::new("due", FieldType::DateTime).nullable())
            .with_field(FieldDef::new("owner", FieldType::ForeignKey("User".into())))
            .with_field(FieldDef::new("tags", FieldType::ManyToMany("Tag".into())))
    }

    fn translate(pairs: &[(&str, Value)]) -> SqlQuery {
        let predicates =
            LookupPredicate::parse_all(pairs.iter().map(|(k, v)| (*k, v.clone()))).unwrap();
        SqlTranslator::translate(SqlDialect::MySql, &schema(), &predicates)
    }

    fn translate_sqlite(pairs: &[(&str, Value)]) -> SqlQuery {
        let predicates =
            LookupPredicate::parse_all(pairs.iter().map(|(k, v)| (*k, v.clone()))).unwrap();
        SqlTranslator::translate(SqlDialect::Sqlite, &schema(), &predicates)
    }

    #[test]
    fn test_empty_is_true() {
        let sql = translate(&[]);
        assert_eq!(sql.clause, "1=1");
        assert!(sql.params.is_empty());
        assert_eq!(sql.residual, 0);
    }

    #[test]
    fn test_simple_exact() {
        let sql = translate(&[("status", json!("new"))]);
        assert_eq!(sql.clause, "status = ?");
        assert_eq!(sql.params, vec![SqlParam::Text("new".into())]);
    }

    #[test]
    fn test_foreign_key_column() {
        let sql = translate(&[("owner", json!({"id": 4}))]);
        assert_eq!(sql.clause, "owner_id = ?");
        assert_eq!(sql.params, vec![SqlParam::Integer(4)]);
    }

    #[test]
    fn test_in_and_empty_in() {
        let sql = translate(&[("points__in", json!([1, 2, null]))]);
        assert_eq!(sql.clause, "points IN (?, ?)");
        assert_eq!(sql.params, vec![SqlParam::Integer(1), SqlParam::Integer(2)]);

        let sql = translate(&[("points__in", json!([]))]);
        assert_eq!(sql.clause, "1=0");
    }

    #[test]
    fn test_and_of_comparisons() {
        let sql = translate(&[("points__gte", json!(3)), ("done", json!(true))]);
        assert_eq!(sql.clause, "(points >= ? AND done = ?)");
        assert_eq!(sql.params, vec![SqlParam::Integer(3), SqlParam::Integer(1)]);
    }

    #[test]
    fn test_datetime_canonicalized() {
        let sql = translate(&[("due__lt", json!("2024-05-01T14:00:00+02:00"))]);
        assert_eq!(sql.clause, "due < ?");
        assert_eq!(sql.params, vec![SqlParam::Text("2024-05-01T12:00:00.000000Z".into())]);
    }

    #[test]
    fn test_range() {
        let sql = translate(&[("points__range", json!([1, 5]))]);
        assert_eq!(sql.clause, "points BETWEEN ? AND ?");
        assert_eq!(sql.params, vec![SqlParam::Integer(1), SqlParam::Integer(5)]);
    }

    #[test]
    fn test_like_escaping() {
        let sql = translate(&[("status__icontains", json!("50%_Off!"))]);
        assert_eq!(sql.clause, "LOWER(status) LIKE ? ESCAPE '!'");
        assert_eq!(sql.params, vec![SqlParam::Text("%50!%!_off!!%".into())]);

        let sql = translate(&[("status__startswith", json!("In"))]);
        assert_eq!(sql.clause, "status LIKE ? ESCAPE '!'");
        assert_eq!(sql.params, vec![SqlParam::Text("In%".into())]);
    }

    #[test]
    fn test_case_insensitive_text_stays_client_side_on_sqlite() {
        let lookups = ["status__iexact", "status__icontains", "status__istartswith", "status__iendswith"];
        for lookup in lookups {
            let sql = translate_sqlite(&[(lookup, json!("new")), ("points", json!(1))]);
            assert_eq!(sql.clause, "points = ?", "{}", lookup);
            assert_eq!(sql.residual, 1);
        }
        // Case-sensitive LIKE is still pushed down: SQLite's is looser, never stricter
        let sql = translate_sqlite(&[("status__contains", json!("ew"))]);
        assert_eq!(sql.clause, "status LIKE ? ESCAPE '!'");
    }

    #[test]
    fn test_non_ascii_case_insensitive_operand_is_residual() {
        let sql = translate(&[("status__icontains", json!("élo"))]);
        assert_eq!(sql.clause, "1=1");
        assert_eq!(sql.residual, 1);

        let sql = translate(&[("status__iexact", json!("NEW"))]);
        assert_eq!(sql.clause, "LOWER(status) = ?");
        assert_eq!(sql.params, vec![SqlParam::Text("new".into())]);
    }

    #[test]
    fn test_null_checks() {
        assert_eq!(translate(&[("due", Value::Null)]).clause, "due IS NULL");
        assert_eq!(translate(&[("due__isnull", json!(false))]).clause, "due IS NOT NULL");
    }

    #[test]
    fn test_client_side_predicates_are_residual() {
        let sql = translate(&[
            ("owner__name", json!("Ann")),
            ("tags__contains", json!(1)),
            ("price__gte", json!("1.5")),
            ("status", json!("new")),
        ]);
        assert_eq!(sql.clause, "status = ?");
        assert_eq!(sql.residual, 3);
    }

    #[test]
    fn test_inline() {
        let sql = SqlTranslator::translate_inline(
            SqlDialect::Sqlite,
            &schema(),
            &[LookupPredicate::exact("status", json!("it's"))],
        );
        assert_eq!(sql, "status = 'it''s'");
    }
}
