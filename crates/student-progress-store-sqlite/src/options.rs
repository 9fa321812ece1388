use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use student_progress_core::KeyValueStore;

use crate::SqliteStore;

/// Durable key/value store over the `options` table; values are JSON text.
#[derive(Clone)]
pub struct SqliteOptions {
    store: SqliteStore,
}

impl SqliteOptions {
    pub(crate) fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

impl KeyValueStore for SqliteOptions {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT option_value FROM options WHERE option_name = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read option {key}"))
        })?;

        raw.map(|text| {
            serde_json::from_str(&text).with_context(|| format!("option {key} is not valid JSON"))
        })
        .transpose()
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value).context("failed to serialize option value")?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO options(option_name, option_value) VALUES (?1, ?2)
                 ON CONFLICT(option_name) DO UPDATE SET option_value = excluded.option_value",
                params![key, text],
            )
            .with_context(|| format!("failed to write option {key}"))?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM options WHERE option_name = ?1", params![key])
                .with_context(|| format!("failed to delete option {key}"))?;
            Ok(())
        })
    }
}
