use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// One cached setting with its declared type. Only what reads need;
/// storage keeps id and description.
#[derive(Debug, Clone)]
pub struct SettingRow {
    pub category: String,
    pub key: String,
    pub value: Option<String>,
    pub value_type: String,
}

impl SettingRow {
    /// Coerces the stored text to its declared type. Coercion is lenient:
    /// a boolean reads true for "true"/"1"/"yes"/"on", a malformed integer
    /// or float reads 0.
    pub fn typed_value(&self) -> Value {
        let raw = self.value.as_deref().unwrap_or("");
        match self.value_type.as_str() {
            "boolean" => {
                let lowered = raw.trim().to_lowercase();
                json!(matches!(lowered.as_str(), "true" | "1" | "yes" | "on"))
            }
            "integer" => json!(raw.trim().parse::<i64>().unwrap_or(0)),
            "float" => json!(raw.trim().parse::<f64>().unwrap_or(0.0)),
            _ => json!(raw),
        }
    }
}

/// In-process settings cache with explicit lifecycle: `load` fills it,
/// `get`/`category` read it, `set` writes through and invalidates.
/// Owned by the app state rather than hiding behind a global.
#[derive(Debug, Default)]
pub struct SettingsCache {
    entries: HashMap<(String, String), SettingRow>,
    loaded: bool,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.loaded = false;
    }

    /// Reloads every active setting from storage.
    pub fn load(&mut self, conn: &Connection) -> anyhow::Result<()> {
        let mut stmt = conn.prepare(
            "SELECT category, key, value, value_type
             FROM settings WHERE is_active = 1",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(SettingRow {
                    category: r.get(0)?,
                    key: r.get(1)?,
                    value: r.get(2)?,
                    value_type: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        self.entries = rows
            .into_iter()
            .map(|row| ((row.category.clone(), row.key.clone()), row))
            .collect();
        self.loaded = true;
        Ok(())
    }

    fn ensure_loaded(&mut self, conn: &Connection) -> anyhow::Result<()> {
        if !self.loaded {
            self.load(conn)?;
        }
        Ok(())
    }

    pub fn get(
        &mut self,
        conn: &Connection,
        category: &str,
        key: &str,
    ) -> anyhow::Result<Option<Value>> {
        self.ensure_loaded(conn)?;
        Ok(self
            .entries
            .get(&(category.to_string(), key.to_string()))
            .map(SettingRow::typed_value))
    }

    /// All settings under one category, keyed by setting key.
    pub fn category(
        &mut self,
        conn: &Connection,
        category: &str,
    ) -> anyhow::Result<HashMap<String, Value>> {
        self.ensure_loaded(conn)?;
        Ok(self
            .entries
            .values()
            .filter(|row| row.category == category)
            .map(|row| (row.key.clone(), row.typed_value()))
            .collect())
    }

    /// Upserts a setting and drops the cache so the next read sees it.
    pub fn set(
        &mut self,
        conn: &Connection,
        category: &str,
        key: &str,
        value: &str,
        value_type: &str,
        description: Option<&str>,
        now: &str,
    ) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO settings(id, category, key, value, value_type, description, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(category, key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                description = COALESCE(excluded.description, settings.description),
                updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                category,
                key,
                value,
                value_type,
                description,
                now,
            ),
        )?;
        self.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::init_schema(&conn).expect("init schema");
        conn
    }

    #[test]
    fn typed_value_coercions_are_lenient() {
        let mut row = SettingRow {
            category: "bursar".to_string(),
            key: "k".to_string(),
            value: Some("yes".to_string()),
            value_type: "boolean".to_string(),
        };
        assert_eq!(row.typed_value(), json!(true));
        row.value = Some("off".to_string());
        assert_eq!(row.typed_value(), json!(false));

        row.value_type = "integer".to_string();
        row.value = Some("42".to_string());
        assert_eq!(row.typed_value(), json!(42));
        row.value = Some("not-a-number".to_string());
        assert_eq!(row.typed_value(), json!(0));

        row.value_type = "float".to_string();
        row.value = Some("3.5".to_string());
        assert_eq!(row.typed_value(), json!(3.5));
        row.value = None;
        assert_eq!(row.typed_value(), json!(0.0));

        row.value_type = "string".to_string();
        row.value = Some("Term One".to_string());
        assert_eq!(row.typed_value(), json!("Term One"));
    }

    #[test]
    fn set_writes_through_and_next_get_sees_it() {
        let conn = test_conn();
        let mut cache = SettingsCache::new();

        assert_eq!(cache.get(&conn, "bursar", "currency").expect("get"), None);

        cache
            .set(&conn, "bursar", "currency", "UGX", "string", None, "2026-03-02")
            .expect("set");
        assert_eq!(
            cache.get(&conn, "bursar", "currency").expect("get"),
            Some(json!("UGX"))
        );

        // Same (category, key) updates in place.
        cache
            .set(&conn, "bursar", "currency", "KES", "string", None, "2026-03-03")
            .expect("set again");
        assert_eq!(
            cache.get(&conn, "bursar", "currency").expect("get"),
            Some(json!("KES"))
        );
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn category_listing_groups_by_category() {
        let conn = test_conn();
        let mut cache = SettingsCache::new();
        cache
            .set(&conn, "bursar", "currency", "UGX", "string", None, "t")
            .expect("set");
        cache
            .set(&conn, "bursar", "late_fee", "5000", "integer", None, "t")
            .expect("set");
        cache
            .set(&conn, "school", "name", "Hill Academy", "string", None, "t")
            .expect("set");

        let bursar = cache.category(&conn, "bursar").expect("category");
        assert_eq!(bursar.len(), 2);
        assert_eq!(bursar.get("late_fee"), Some(&json!(5000)));
        assert!(cache.category(&conn, "missing").expect("category").is_empty());
    }

    #[test]
    fn stale_reads_survive_until_invalidate() {
        let conn = test_conn();
        let mut cache = SettingsCache::new();
        cache
            .set(&conn, "bursar", "currency", "UGX", "string", None, "t")
            .expect("set");
        assert_eq!(
            cache.get(&conn, "bursar", "currency").expect("get"),
            Some(json!("UGX"))
        );

        // Out-of-band write: the cache serves the old value until told.
        conn.execute(
            "UPDATE settings SET value = 'TZS' WHERE category = 'bursar' AND key = 'currency'",
            [],
        )
        .expect("raw update");
        assert_eq!(
            cache.get(&conn, "bursar", "currency").expect("get"),
            Some(json!("UGX"))
        );

        cache.invalidate();
        assert_eq!(
            cache.get(&conn, "bursar", "currency").expect("get"),
            Some(json!("TZS"))
        );
    }
}
