//! Schema registry: the payload columns a queue table knows about.
//!
//! Columns are discovered from `PRAGMA table_info` and grown on insert. A
//! column's type is fixed by the first value ever written to it; a column
//! declared without a type (the dedup column) takes the type of its first
//! stored value.

use rusqlite::{Connection, OptionalExtension};

use super::{ID_COLUMN, STATUS_COLUMN, TS_COLUMN};
use crate::domain::value::validate_field_name;
use crate::domain::{ColumnType, FieldValue, QueueError, Record, Result};
use crate::store::quote_ident;

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// `None` until the first value lands in an untyped column.
    pub ty: Option<ColumnType>,
}

/// Changes a batch of records requires before it can be inserted.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct SchemaChange {
    /// Columns to `ALTER TABLE ... ADD`.
    pub new_columns: Vec<(String, ColumnType)>,
    /// Existing untyped columns that receive their first type.
    pub typed: Vec<(String, ColumnType)>,
}

impl SchemaChange {
    pub fn is_empty(&self) -> bool {
        self.new_columns.is_empty() && self.typed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaRegistry {
    columns: Vec<Column>,
}

impl SchemaRegistry {
    /// Read the payload columns of `table`.
    pub(crate) fn load(conn: &Connection, table: &str) -> Result<Self> {
        let quoted = quote_ident(table);
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted})"))?;
        let declared = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut columns = Vec::new();
        for (name, decl) in declared {
            if matches!(name.as_str(), ID_COLUMN | TS_COLUMN | STATUS_COLUMN) {
                continue;
            }
            let ty = match ColumnType::from_declared(&decl) {
                Some(ty) => Some(ty),
                None => Self::infer_type(conn, &quoted, &name)?,
            };
            columns.push(Column { name, ty });
        }
        Ok(Self { columns })
    }

    fn infer_type(conn: &Connection, table: &str, column: &str) -> Result<Option<ColumnType>> {
        let col = quote_ident(column);
        let sql = format!("SELECT typeof({col}) FROM {table} WHERE {col} IS NOT NULL LIMIT 1");
        let class = conn
            .query_row(&sql, [], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(class.as_deref().and_then(ColumnType::from_storage_class))
    }

    /// Column names compare case-insensitively, as in `SQLite`.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Validate a batch and work out the schema change it needs.
    ///
    /// Returns the records with values coerced to their column types. Any
    /// failure rejects the whole batch.
    pub(crate) fn plan(&self, records: &[Record]) -> Result<(Vec<Record>, SchemaChange)> {
        let mut change = SchemaChange::default();
        let mut coerced = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            if record.is_empty() {
                return Err(QueueError::InvalidRecord {
                    index,
                    reason: "record is empty".to_string(),
                });
            }
            let mut out = Record::new();
            for (name, value) in record.iter() {
                validate_field_name(name)
                    .map_err(|reason| QueueError::InvalidRecord { index, reason })?;
                if out.names().any(|seen| seen.eq_ignore_ascii_case(name)) {
                    return Err(QueueError::InvalidRecord {
                        index,
                        reason: format!("field `{name}` appears twice (names ignore case)"),
                    });
                }

                if let FieldValue::Real(x) = value
                    && !x.is_finite()
                {
                    return Err(QueueError::InvalidRecord {
                        index,
                        reason: format!("field `{name}` holds non-finite real {x}"),
                    });
                }
                // Stored under the column's existing spelling.
                let name = self
                    .column(name)
                    .map(|c| c.name.as_str())
                    .or_else(|| {
                        change
                            .new_columns
                            .iter()
                            .find(|(n, _)| n.eq_ignore_ascii_case(name))
                            .map(|(n, _)| n.as_str())
                    })
                    .unwrap_or(name)
                    .to_string();
                let name = name.as_str();

                let known = self
                    .column(name)
                    .and_then(|c| c.ty)
                    .or_else(|| lookup(&change.typed, name))
                    .or_else(|| lookup(&change.new_columns, name));

                let value = match known {
                    Some(ty) => ty.coerce(value).map_err(|found| QueueError::SchemaConflict {
                        column: name.to_string(),
                        expected: ty,
                        found,
                    })?,
                    None => {
                        let ty = value.column_type();
                        if self.contains(name) {
                            change.typed.push((name.to_string(), ty));
                        } else {
                            change.new_columns.push((name.to_string(), ty));
                        }
                        value.clone()
                    }
                };
                out.insert(name, value);
            }
            coerced.push(out);
        }
        Ok((coerced, change))
    }

    /// Record a committed change.
    pub(crate) fn apply(&mut self, change: &SchemaChange) {
        for (name, ty) in &change.typed {
            if let Some(column) = self
                .columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(name))
            {
                column.ty = Some(*ty);
            }
        }
        for (name, ty) in &change.new_columns {
            if !self.contains(name) {
                self.columns.push(Column {
                    name: name.clone(),
                    ty: Some(*ty),
                });
            }
        }
    }
}

fn lookup(entries: &[(String, ColumnType)], name: &str) -> Option<ColumnType> {
    entries
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, ty)| *ty)
}
