// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL source store (SQLite / MySQL through the sqlx `Any` driver).
//!
//! One table per model, named by [`ModelSchema::table`]:
//!
//! ```sql
//! CREATE TABLE task (
//!   id INTEGER PRIMARY KEY,      -- BIGINT AUTO_INCREMENT on MySQL
//!   status TEXT NOT NULL,
//!   price TEXT NOT NULL,         -- decimals as exact text
//!   due TEXT,                    -- RFC 3339, microsecond precision, UTC
//!   done INTEGER NOT NULL,       -- booleans as 0/1
//!   owner_id INTEGER             -- foreign key
//! );
//! CREATE TABLE task_tags (       -- many-to-many link table
//!   owner_id INTEGER NOT NULL,
//!   related_id INTEGER NOT NULL,
//!   PRIMARY KEY (owner_id, related_id)
//! );
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Decimal, datetime, date and JSON columns are TEXT: the `Any` driver has no
//! mapping for MySQL's DECIMAL/DATETIME/JSON types, and reads TEXT back as a
//! BLOB on MySQL (we fall back to `Vec<u8>`). Text that no longer parses as
//! its declared type is returned as [`FieldValue::Text`] and rejected later
//! by the serializer.
//!
//! Relations are loaded one level deep for models whose schema was handed to
//! [`SqlSourceStore::register_schema`]; others come back as ids.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::debug;

use super::traits::{SourceStore, StorageError};
use crate::query::lookup::LookupPredicate;
use crate::query::matcher::{parse_date, parse_datetime, parse_decimal};
use crate::query::sql_translator::{
    column_name, datetime_column_text, SqlDialect, SqlParam, SqlTranslator,
};
use crate::record::{FieldMap, FieldValue, Record, RecordId, RelatedRef};
use crate::resilience::retry::{retry, retry_when, RetryConfig};
use crate::schema::{FieldDef, FieldType, ModelSchema};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Ids per `IN (...)` list.
const IN_CHUNK: usize = 500;

fn db(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_transient(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

fn check_identifiers(schema: &ModelSchema) -> Result<(), StorageError> {
    let bad = std::iter::once(schema.table())
        .chain(schema.fields().iter().map(|f| f.name.as_str()))
        .find(|name| !is_identifier(name));
    match bad {
        Some(name) => Err(StorageError::Backend(format!(
            "'{}' is not a valid SQL identifier",
            name
        ))),
        None => Ok(()),
    }
}

fn link_table(schema: &ModelSchema, field: &FieldDef) -> String {
    format!("{}_{}", schema.table(), field.name)
}

fn bind_params<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Option<SqlParam>],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Some(SqlParam::Text(s)) => query.bind(s.clone()),
            Some(SqlParam::Integer(i)) => query.bind(*i),
            Some(SqlParam::Numeric(f)) => query.bind(*f),
            None => query.bind(Option::<String>::None),
        };
    }
    query
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn get_text(row: &AnyRow, column: &str) -> Result<Option<String>, sqlx::Error> {
    match row.try_get::<Option<String>, _>(column) {
        Ok(value) => Ok(value),
        Err(_) => row
            .try_get::<Option<Vec<u8>>, _>(column)
            .map(|bytes| bytes.map(|b| String::from_utf8_lossy(&b).into_owned())),
    }
}

fn decode_column(row: &AnyRow, def: &FieldDef, column: &str) -> Result<FieldValue, StorageError> {
    let value = match &def.field_type {
        FieldType::Integer => row
            .try_get::<Option<i64>, _>(column)
            .map_err(db)?
            .map(FieldValue::Int),
        FieldType::ForeignKey(_) => row
            .try_get::<Option<i64>, _>(column)
            .map_err(db)?
            .map(|id| FieldValue::Ref(RelatedRef::Id(RecordId(id)))),
        FieldType::Float => row
            .try_get::<Option<f64>, _>(column)
            .map_err(db)?
            .map(FieldValue::Float),
        FieldType::Boolean => match row.try_get::<Option<i64>, _>(column) {
            Ok(v) => v.map(|i| FieldValue::Bool(i != 0)),
            Err(_) => row
                .try_get::<Option<bool>, _>(column)
                .map_err(db)?
                .map(FieldValue::Bool),
        },
        FieldType::Text => get_text(row, column).map_err(db)?.map(FieldValue::Text),
        FieldType::Decimal => match get_text(row, column) {
            Ok(text) => text.map(|s| match parse_decimal(&s) {
                Some(d) => FieldValue::Decimal(d),
                None => FieldValue::Text(s),
            }),
            Err(_) => row
                .try_get::<Option<f64>, _>(column)
                .map_err(db)?
                .and_then(|f| Decimal::try_from(f).ok())
                .map(FieldValue::Decimal),
        },
        FieldType::DateTime => get_text(row, column).map_err(db)?.map(|s| match parse_datetime(&s) {
            Some(dt) => FieldValue::DateTime(dt),
            None => FieldValue::Text(s),
        }),
        FieldType::Date => get_text(row, column).map_err(db)?.map(|s| match parse_date(&s) {
            Some(d) => FieldValue::Date(d),
            None => FieldValue::Text(s),
        }),
        FieldType::Json => get_text(row, column).map_err(db)?.map(|s| {
            match serde_json::from_str(&s) {
                Ok(v) => FieldValue::Json(v),
                Err(_) => FieldValue::Text(s),
            }
        }),
        FieldType::ManyToMany(_) => Some(FieldValue::RefMany(Vec::new())),
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

fn encode_column(def: &FieldDef, value: &FieldValue) -> Result<Option<SqlParam>, StorageError> {
    let param = match (&def.field_type, value) {
        (_, FieldValue::Null) => None,
        (FieldType::Integer, FieldValue::Int(i)) => Some(SqlParam::Integer(*i)),
        (FieldType::Float, FieldValue::Float(f)) => Some(SqlParam::Numeric(*f)),
        (FieldType::Float, FieldValue::Int(i)) => Some(SqlParam::Numeric(*i as f64)),
        (FieldType::Decimal, FieldValue::Decimal(d)) => Some(SqlParam::Text(d.to_string())),
        (FieldType::Decimal, FieldValue::Int(i)) => Some(SqlParam::Text(i.to_string())),
        (FieldType::Text, FieldValue::Text(s)) => Some(SqlParam::Text(s.clone())),
        (FieldType::Boolean, FieldValue::Bool(b)) => Some(SqlParam::Integer(i64::from(*b))),
        (FieldType::DateTime, FieldValue::DateTime(dt)) => Some(SqlParam::Text(datetime_column_text(dt))),
        (FieldType::Date, FieldValue::Date(d)) => Some(SqlParam::Text(d.format("%Y-%m-%d").to_string())),
        (FieldType::Json, FieldValue::Json(v)) => Some(SqlParam::Text(v.to_string())),
        (FieldType::ForeignKey(_), FieldValue::Ref(r)) => Some(SqlParam::Integer(r.id().0)),
        (FieldType::ForeignKey(_), FieldValue::Int(i)) => Some(SqlParam::Integer(*i)),
        (ty, other) => {
            return Err(StorageError::Backend(format!(
                "cannot store {} in {} column '{}'",
                other.type_name(),
                ty,
                def.name
            )))
        }
    };
    Ok(param)
}

fn related_ids(value: &FieldValue) -> Result<Vec<RecordId>, StorageError> {
    match value {
        FieldValue::Null => Ok(Vec::new()),
        FieldValue::RefMany(refs) => Ok(refs.iter().map(RelatedRef::id).collect()),
        other => Err(StorageError::Backend(format!(
            "cannot store {} in a link table",
            other.type_name()
        ))),
    }
}

/// Splits a write into column assignments and link-table replacements.
struct WritePlan {
    columns: Vec<(String, Option<SqlParam>)>,
    links: Vec<(String, Vec<RecordId>)>,
}

impl WritePlan {
    fn new(schema: &ModelSchema, fields: &FieldMap) -> Result<Self, StorageError> {
        let mut columns = Vec::new();
        let mut links = Vec::new();
        for (name, value) in fields {
            let def = schema.field(name).ok_or_else(|| {
                StorageError::Backend(format!("no such column: {}.{}", schema.table(), name))
            })?;
            match column_name(def) {
                Some(column) => columns.push((column, encode_column(def, value)?)),
                None => links.push((link_table(schema, def), related_ids(value)?)),
            }
        }
        Ok(Self { columns, links })
    }
}

pub struct SqlSourceStore {
    pool: AnyPool,
    is_sqlite: bool,
    schemas: DashMap<String, Arc<ModelSchema>>,
}

impl SqlSourceStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let in_memory = connection_string.contains(":memory:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                // Every connection to `sqlite::memory:` is a separate database
                .max_connections(if in_memory { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(db)
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            schemas: DashMap::new(),
        };
        if is_sqlite && !in_memory {
            store.enable_wal_mode().await?;
        }
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    /// Make `schema` known for relation loading.
    pub fn register_schema(&self, schema: &ModelSchema) -> Result<(), StorageError> {
        check_identifiers(schema)?;
        self.schemas
            .insert(schema.name().to_string(), Arc::new(schema.clone()));
        Ok(())
    }

    /// Builder-style [`register_schema`](Self::register_schema).
    pub fn with_schema(self, schema: &ModelSchema) -> Result<Self, StorageError> {
        self.register_schema(schema)?;
        Ok(self)
    }

    /// `CREATE TABLE IF NOT EXISTS` for the model table and its link tables.
    /// Also registers the schema.
    pub async fn create_tables(&self, schema: &ModelSchema) -> Result<(), StorageError> {
        self.register_schema(schema)?;

        let (pk, int, real, text) = if self.is_sqlite {
            ("INTEGER PRIMARY KEY", "INTEGER", "REAL", "TEXT")
        } else {
            ("BIGINT AUTO_INCREMENT PRIMARY KEY", "BIGINT", "DOUBLE", "TEXT")
        };

        let mut columns = vec![format!("id {}", pk)];
        let mut statements = Vec::new();
        for def in schema.data_fields() {
            let Some(column) = column_name(def) else {
                statements.push(format!(
                    "CREATE TABLE IF NOT EXISTS {} (owner_id {int} NOT NULL, related_id {int} NOT NULL, PRIMARY KEY (owner_id, related_id))",
                    link_table(schema, def),
                ));
                continue;
            };
            let sql_type = match def.field_type {
                FieldType::Integer | FieldType::Boolean | FieldType::ForeignKey(_) => int,
                FieldType::Float => real,
                _ => text,
            };
            let null = if def.nullable { "NULL" } else { "NOT NULL" };
            columns.push(format!("{} {} {}", column, sql_type, null));
        }
        statements.insert(
            0,
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                schema.table(),
                columns.join(", ")
            ),
        );

        for sql in &statements {
            retry("sql_create_table", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(db)
            })
            .await?;
        }
        Ok(())
    }

    fn known_schema(&self, model: &str) -> Option<Arc<ModelSchema>> {
        self.schemas.get(model).map(|s| Arc::clone(s.value()))
    }

    /// Rows of `schema` matching `clause`, with link-table ids filled in.
    async fn fetch_rows(
        &self,
        schema: &ModelSchema,
        clause: &str,
        params: &[Option<SqlParam>],
    ) -> Result<Vec<(RecordId, FieldMap)>, StorageError> {
        let mut columns = vec!["id".to_string()];
        let mut scalar: Vec<(&FieldDef, String)> = Vec::new();
        for def in schema.data_fields() {
            if let Some(column) = column_name(def) {
                columns.push(column.clone());
                scalar.push((def, column));
            }
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id",
            columns.join(", "),
            schema.table(),
            clause
        );

        let rows = retry_when("sql_select", &RetryConfig::query(), is_transient, || async {
            bind_params(sqlx::query(&sql), params)
                .fetch_all(&self.pool)
                .await
        })
        .await
        .map_err(db)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(db)?;
            let mut fields = FieldMap::new();
            for (def, column) in &scalar {
                fields.insert(def.name.clone(), decode_column(row, def, column)?);
            }
            out.push((RecordId(id), fields));
        }

        for def in schema.data_fields().filter(|d| d.field_type.is_many()) {
            let links = self
                .fetch_links(&link_table(schema, def), out.iter().map(|(id, _)| *id))
                .await?;
            for (id, fields) in &mut out {
                let refs = links
                    .get(id)
                    .map(|ids| ids.iter().copied().map(RelatedRef::Id).collect())
                    .unwrap_or_default();
                fields.insert(def.name.clone(), FieldValue::RefMany(refs));
            }
        }
        Ok(out)
    }

    async fn fetch_links(
        &self,
        table: &str,
        owners: impl Iterator<Item = RecordId>,
    ) -> Result<HashMap<RecordId, Vec<RecordId>>, StorageError> {
        let owners: Vec<Option<SqlParam>> = owners.map(|id| Some(SqlParam::Integer(id.0))).collect();
        let mut links: HashMap<RecordId, Vec<RecordId>> = HashMap::new();
        for chunk in owners.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT owner_id, related_id FROM {} WHERE owner_id IN ({}) ORDER BY owner_id, related_id",
                table,
                placeholders(chunk.len())
            );
            let rows = retry_when("sql_select_links", &RetryConfig::query(), is_transient, || async {
                bind_params(sqlx::query(&sql), chunk)
                    .fetch_all(&self.pool)
                    .await
            })
            .await
            .map_err(db)?;
            for row in &rows {
                let owner: i64 = row.try_get("owner_id").map_err(db)?;
                let related: i64 = row.try_get("related_id").map_err(db)?;
                links.entry(RecordId(owner)).or_default().push(RecordId(related));
            }
        }
        Ok(links)
    }

    /// Replace relation ids with loaded records (one level) where the related
    /// schema is known and the row exists.
    async fn load_relations(
        &self,
        schema: &ModelSchema,
        rows: Vec<(RecordId, FieldMap)>,
    ) -> Result<Vec<Record>, StorageError> {
        let mut records: Vec<Record> = rows
            .into_iter()
            .map(|(id, fields)| Record {
                model: schema.name().to_string(),
                id,
                fields,
            })
            .collect();

        for def in schema.data_fields() {
            let Some(related_model) = def.field_type.related_model() else {
                continue;
            };
            let Some(related_schema) = self.known_schema(related_model) else {
                debug!(model = %schema.name(), related = %related_model, "Related schema unknown, leaving ids");
                continue;
            };

            let mut wanted: Vec<RecordId> = records
                .iter()
                .filter_map(|r| r.fields.get(&def.name))
                .flat_map(|v| match v {
                    FieldValue::Ref(r) => vec![r.id()],
                    FieldValue::RefMany(refs) => refs.iter().map(RelatedRef::id).collect(),
                    _ => Vec::new(),
                })
                .collect();
            wanted.sort();
            wanted.dedup();

            let mut loaded: BTreeMap<RecordId, Record> = BTreeMap::new();
            for chunk in wanted.chunks(IN_CHUNK) {
                let params: Vec<Option<SqlParam>> =
                    chunk.iter().map(|id| Some(SqlParam::Integer(id.0))).collect();
                let clause = format!("id IN ({})", placeholders(params.len()));
                for (id, fields) in self.fetch_rows(&related_schema, &clause, &params).await? {
                    loaded.insert(
                        id,
                        Record {
                            model: related_model.to_string(),
                            id,
                            fields,
                        },
                    );
                }
            }

            let resolve = |r: &mut RelatedRef| {
                if let Some(record) = loaded.get(&r.id()) {
                    *r = RelatedRef::Loaded(Box::new(record.clone()));
                }
            };
            for record in &mut records {
                match record.fields.get_mut(&def.name) {
                    Some(FieldValue::Ref(r)) => resolve(r),
                    Some(FieldValue::RefMany(refs)) => refs.iter_mut().for_each(resolve),
                    _ => {}
                }
            }
        }
        Ok(records)
    }

    async fn fetch_one(&self, schema: &ModelSchema, id: RecordId) -> Result<Record, StorageError> {
        let rows = self
            .fetch_rows(schema, "id = ?", &[Some(SqlParam::Integer(id.0))])
            .await?;
        self.load_relations(schema, rows)
            .await?
            .pop()
            .ok_or(StorageError::NotFound)
    }

    async fn replace_links(
        tx: &mut sqlx::Transaction<'_, Any>,
        id: RecordId,
        links: &[(String, Vec<RecordId>)],
    ) -> Result<(), StorageError> {
        for (table, related) in links {
            sqlx::query(&format!("DELETE FROM {} WHERE owner_id = ?", table))
                .bind(id.0)
                .execute(&mut **tx)
                .await
                .map_err(db)?;
            for related_id in related {
                sqlx::query(&format!(
                    "INSERT INTO {} (owner_id, related_id) VALUES (?, ?)",
                    table
                ))
                .bind(id.0)
                .bind(related_id.0)
                .execute(&mut **tx)
                .await
                .map_err(db)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for SqlSourceStore {
    async fn query(
        &self,
        schema: &ModelSchema,
        predicates: &[LookupPredicate],
    ) -> Result<Vec<Record>, StorageError> {
        check_identifiers(schema)?;
        let dialect = if self.is_sqlite { SqlDialect::Sqlite } else { SqlDialect::MySql };
        let translated = SqlTranslator::translate(dialect, schema, predicates);
        if translated.residual > 0 {
            debug!(
                model = %schema.name(),
                residual = translated.residual,
                "Predicates left to client-side filtering"
            );
        }
        let params: Vec<Option<SqlParam>> = translated.params.into_iter().map(Some).collect();
        let rows = self.fetch_rows(schema, &translated.clause, &params).await?;
        self.load_relations(schema, rows).await
    }

    async fn insert(&self, schema: &ModelSchema, fields: FieldMap) -> Result<Record, StorageError> {
        check_identifiers(schema)?;
        let plan = WritePlan::new(schema, &fields)?;

        let sql = if plan.columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", schema.table())
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                schema.table(),
                plan.columns
                    .iter()
                    .map(|(c, _)| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                placeholders(plan.columns.len())
            )
        };
        let params: Vec<Option<SqlParam>> = plan.columns.iter().map(|(_, p)| p.clone()).collect();

        let mut tx = self.pool.begin().await.map_err(db)?;
        let result = bind_params(sqlx::query(&sql), &params)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        let id = if self.is_sqlite {
            // The Any driver does not surface SQLite rowids; same connection, same transaction
            sqlx::query_scalar::<_, i64>("SELECT last_insert_rowid()")
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?
        } else {
            result
                .last_insert_id()
                .ok_or_else(|| StorageError::Backend("driver returned no insert id".into()))?
        };
        let id = RecordId(id);
        Self::replace_links(&mut tx, id, &plan.links).await?;
        tx.commit().await.map_err(db)?;

        self.fetch_one(schema, id).await
    }

    async fn update_by_id(
        &self,
        schema: &ModelSchema,
        id: RecordId,
        fields: FieldMap,
    ) -> Result<Record, StorageError> {
        check_identifiers(schema)?;
        let plan = WritePlan::new(schema, &fields)?;

        let mut tx = self.pool.begin().await.map_err(db)?;
        let exists = sqlx::query(&format!("SELECT id FROM {} WHERE id = ?", schema.table()))
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .is_some();
        if !exists {
            return Err(StorageError::NotFound);
        }

        if !plan.columns.is_empty() {
            let assignments = plan
                .columns
                .iter()
                .map(|(c, _)| format!("{} = ?", c))
                .collect::<Vec<_>>()
                .join(", ");
            let mut params: Vec<Option<SqlParam>> =
                plan.columns.iter().map(|(_, p)| p.clone()).collect();
            params.push(Some(SqlParam::Integer(id.0)));
            let sql = format!("UPDATE {} SET {} WHERE id = ?", schema.table(), assignments);
            bind_params(sqlx::query(&sql), &params)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        Self::replace_links(&mut tx, id, &plan.links).await?;
        tx.commit().await.map_err(db)?;

        self.fetch_one(schema, id).await
    }

    async fn delete_by_id(&self, schema: &ModelSchema, id: RecordId) -> Result<bool, StorageError> {
        check_identifiers(schema)?;
        let mut tx = self.pool.begin().await.map_err(db)?;
        for def in schema.data_fields().filter(|d| d.field_type.is_many()) {
            sqlx::query(&format!("DELETE FROM {} WHERE owner_id = ?", link_table(schema, def)))
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", schema.table()))
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected() > 0)
    }
}
