//! Helper types for building table models on top of [`PROXY`].
//!
//! This crate defines no tables itself. Packages that do implement [`Table`]
//! for their schema and [`NameTable`] for lookup tables keyed by `id` and
//! `name`, and use the field helpers for enum and JSON columns.

pub mod mediawiki;

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::{Backend, Row, Value};
use crate::proxy::PROXY;
use crate::state::connect;

use parking_lot::RwLock;
use std::collections::HashMap;

// ========== Field helpers ==========

/// A string column restricted to a fixed set of values.
///
/// Stored as a `VARCHAR` sized to the longest value with a `CHECK`
/// constraint, and validated before binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumField {
    values: Vec<String>,
    maxlen: usize,
}

impl EnumField {
    /// Create a field from its allowed values.
    pub fn new<I, S>(values: I) -> ChimeDbResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(ChimeDbError::validation("An enum field needs at least one value"));
        }
        if let Some(bad) = values.iter().find(|v| v.contains('\'')) {
            return Err(ChimeDbError::validation(format!("Enum value {bad} contains a quote")));
        }
        let maxlen = values.iter().map(|v| v.chars().count()).max().unwrap_or(0);
        Ok(Self { values, maxlen })
    }

    /// Allowed values, in declaration order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Length of the longest allowed value.
    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    /// True if `value` is allowed.
    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    /// Check `value`, returning it as a bindable [`Value`].
    pub fn validate(&self, value: &str) -> ChimeDbResult<Value> {
        if self.contains(value) {
            Ok(Value::from(value))
        } else {
            Err(ChimeDbError::validation(format!(
                "Value {value} not in ENUM({})",
                self.quoted().join(", ")
            )))
        }
    }

    /// Column definition for a `CREATE TABLE` statement.
    pub fn column_definition(&self, column: &str) -> String {
        format!(
            "{column} VARCHAR({}) CHECK ({column} IN ({}))",
            self.maxlen,
            self.quoted().join(", ")
        )
    }

    fn quoted(&self) -> Vec<String> {
        self.values.iter().map(|v| format!("'{v}'")).collect()
    }
}

/// A text column holding a JSON object.
pub struct JsonDictField;

impl JsonDictField {
    /// Column type used in `CREATE TABLE` statements.
    pub const COLUMN_TYPE: &'static str = "TEXT";

    /// Serialize for storage. Anything but an object or `None` is rejected.
    pub fn to_db(value: Option<&serde_json::Value>) -> ChimeDbResult<Value> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Value::Null),
            Some(serde_json::Value::Object(map)) => Ok(Value::Text(serde_json::to_string(map)?)),
            Some(other) => Err(ChimeDbError::validation(format!(
                "Value must be a JSON object. Received {}",
                json_kind(other)
            ))),
        }
    }

    /// Deserialize a stored value. The text must hold a JSON object.
    pub fn from_db(
        value: &Value,
    ) -> ChimeDbResult<Option<serde_json::Map<String, serde_json::Value>>> {
        let text = match value {
            Value::Null => return Ok(None),
            Value::Text(text) => text,
            other => {
                return Err(ChimeDbError::validation(format!(
                    "Expected JSON text in database, got {other:?}"
                )))
            }
        };
        match serde_json::from_str(text)? {
            serde_json::Value::Object(map) => Ok(Some(map)),
            other => Err(ChimeDbError::validation(format!(
                "Database value must convert to a JSON object. Got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ========== Name tables ==========

struct CacheEntries<T> {
    by_name: HashMap<String, T>,
    by_id: HashMap<i64, T>,
    filled: bool,
}

/// Process-wide lookup cache for a [`NameTable`].
///
/// Declare one as a `static` next to the model:
///
/// ```ignore
/// static CACHE: NameCache<Telescope> = NameCache::new();
/// ```
pub struct NameCache<T> {
    entries: RwLock<Option<CacheEntries<T>>>,
}

impl<T: Clone> NameCache<T> {
    /// An empty cache.
    pub const fn new() -> Self {
        Self { entries: parking_lot::const_rwlock(None) }
    }

    fn by_name(&self, name: &str) -> Option<T> {
        self.entries.read().as_ref().and_then(|e| e.by_name.get(name).cloned())
    }

    fn by_id(&self, id: i64) -> Option<T> {
        self.entries.read().as_ref().and_then(|e| e.by_id.get(&id).cloned())
    }

    fn is_filled(&self) -> bool {
        self.entries.read().as_ref().is_some_and(|e| e.filled)
    }

    fn with_entries(&self, f: impl FnOnce(&mut CacheEntries<T>)) {
        let mut entries = self.entries.write();
        f(entries.get_or_insert_with(|| CacheEntries {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            filled: false,
        }));
    }

    fn insert(&self, id: i64, name: String, row: T) {
        self.with_entries(|entries| {
            entries.by_id.insert(id, row.clone());
            entries.by_name.insert(name, row);
        });
    }

    // An empty table still counts as filled.
    fn mark_filled(&self) {
        self.with_entries(|entries| entries.filled = true);
    }

    /// Number of cached rows.
    pub fn len(&self) -> usize {
        self.entries.read().as_ref().map_or(0, |e| e.by_id.len())
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every cached row.
    pub fn clear(&self) {
        *self.entries.write() = None;
    }
}

impl<T: Clone> Default for NameCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A table with `id` and `name` columns whose rows are looked up often.
///
/// Lookups go through [`PROXY`] once per key and are cached afterwards.
pub trait NameTable: Clone + Sized + 'static {
    /// SQL table name.
    const TABLE: &'static str;

    /// The model's cache.
    fn cache() -> &'static NameCache<Self>;

    /// Build a model from a `SELECT *` row.
    fn from_row(row: &Row) -> ChimeDbResult<Self>;

    /// Value of the `id` column.
    fn id(&self) -> i64;

    /// Value of the `name` column.
    fn name(&self) -> &str;

    /// Row whose `name` column equals `name`.
    fn from_name(name: &str) -> ChimeDbResult<Self> {
        if let Some(row) = Self::cache().by_name(name) {
            return Ok(row);
        }
        let sql = format!("SELECT * FROM {} WHERE name = $1", Self::TABLE);
        fetch_one::<Self>(&sql, Value::from(name), || format!("name '{name}'"))
    }

    /// Row whose `id` column equals `id`.
    fn from_id(id: i64) -> ChimeDbResult<Self> {
        if let Some(row) = Self::cache().by_id(id) {
            return Ok(row);
        }
        let sql = format!("SELECT * FROM {} WHERE id = $1", Self::TABLE);
        fetch_one::<Self>(&sql, Value::from(id), || format!("id {id}"))
    }

    /// Cache every row of the table. Only the first call queries.
    fn fill_cache() -> ChimeDbResult<()> {
        let cache = Self::cache();
        if cache.is_filled() {
            return Ok(());
        }
        for row in PROXY.query(&format!("SELECT * FROM {}", Self::TABLE), &[])? {
            let item = Self::from_row(&row)?;
            cache.insert(item.id(), item.name().to_string(), item);
        }
        cache.mark_filled();
        tracing::debug!(table = Self::TABLE, rows = cache.len(), "Filled name cache");
        Ok(())
    }

    /// Forget cached lookups for this table.
    fn clear_cache() {
        Self::cache().clear();
    }
}

fn fetch_one<T: NameTable>(
    sql: &str,
    key: Value,
    describe: impl FnOnce() -> String,
) -> ChimeDbResult<T> {
    let row = PROXY.query(sql, &[key])?.into_iter().next().ok_or_else(|| {
        ChimeDbError::not_found(format!("No row in {} with {}", T::TABLE, describe()))
    })?;
    let item = T::from_row(&row)?;
    T::cache().insert(item.id(), item.name().to_string(), item.clone());
    Ok(item)
}

// ========== Table creation ==========

/// A table a model package can create.
pub trait Table {
    /// SQL table name.
    fn table_name(&self) -> &str;

    /// `CREATE TABLE` statement for the given backend.
    fn create_statement(&self, backend: Backend) -> String;
}

/// Create `tables` in one transaction over a read-write connection.
pub fn create_tables(tables: &[&dyn Table]) -> ChimeDbResult<()> {
    let db = connect(true, false)?;
    let backend = db.backend();

    let names: Vec<&str> = tables.iter().map(|t| t.table_name()).collect();
    tracing::info!("Creating tables: {}", names.join(", "));

    PROXY.atomic(|| {
        for table in tables {
            PROXY.execute_batch(&table.create_statement(backend))?;
        }
        Ok(())
    })
}

/// Report which `tables` are missing, creating them instead if `create` is set.
///
/// Uses the proxy's current binding; with `create` a read-write connection is
/// made first. Returns the names of tables that are (still) missing.
pub fn check_tables(tables: &[&dyn Table], create: bool) -> ChimeDbResult<Vec<String>> {
    let backend = if create { connect(true, false)?.backend() } else { PROXY.database()?.backend() };

    let mut missing = Vec::new();
    for table in tables {
        let name = table.table_name();
        if PROXY.table_exists(name)? {
            continue;
        }
        if create {
            tracing::info!("Creating table {name}");
            PROXY.execute_batch(&table.create_statement(backend))?;
        } else {
            tracing::info!("Missing table {name}");
            missing.push(name.to_string());
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, tests::clean_env};
    use crate::services::{Connector, SqliteConnector};
    use serial_test::serial;

    #[derive(Debug, Clone, PartialEq)]
    struct Telescope {
        id: i64,
        name: String,
    }

    static TELESCOPES: NameCache<Telescope> = NameCache::new();

    impl NameTable for Telescope {
        const TABLE: &'static str = "telescope";

        fn cache() -> &'static NameCache<Self> {
            &TELESCOPES
        }

        fn from_row(row: &Row) -> ChimeDbResult<Self> {
            Ok(Self { id: row.try_i64("id")?, name: row.try_str("name")?.to_string() })
        }

        fn id(&self) -> i64 {
            self.id
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Site {
        id: i64,
        name: String,
    }

    static SITES: NameCache<Site> = NameCache::new();

    impl NameTable for Site {
        const TABLE: &'static str = "site";

        fn cache() -> &'static NameCache<Self> {
            &SITES
        }

        fn from_row(row: &Row) -> ChimeDbResult<Self> {
            Ok(Self { id: row.try_i64("id")?, name: row.try_str("name")?.to_string() })
        }

        fn id(&self) -> i64 {
            self.id
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct FlagTable {
        kind: EnumField,
    }

    impl Table for FlagTable {
        fn table_name(&self) -> &str {
            "dataflag"
        }

        fn create_statement(&self, backend: Backend) -> String {
            let id = match backend {
                Backend::Sqlite => "id INTEGER PRIMARY KEY",
                Backend::Postgres => "id SERIAL PRIMARY KEY",
            };
            format!(
                "CREATE TABLE IF NOT EXISTS dataflag ({id}, {}, meta {})",
                self.kind.column_definition("kind"),
                JsonDictField::COLUMN_TYPE
            )
        }
    }

    fn flag_table() -> FlagTable {
        FlagTable { kind: EnumField::new(["manual", "automatic"]).unwrap() }
    }

    #[test]
    fn test_enum_field() {
        let field = EnumField::new(["up", "down", "sideways"]).unwrap();
        assert_eq!(field.maxlen(), 8);
        assert_eq!(field.validate("up").unwrap(), Value::from("up"));
        assert!(matches!(field.validate("left"), Err(ChimeDbError::Validation { .. })));
        assert_eq!(
            field.column_definition("dir"),
            "dir VARCHAR(8) CHECK (dir IN ('up', 'down', 'sideways'))"
        );

        assert!(EnumField::new(Vec::<String>::new()).is_err());
        assert!(EnumField::new(["it's"]).is_err());
    }

    #[test]
    fn test_json_dict_field() {
        let value = serde_json::json!({"freq": 600.0, "inputs": [1, 2]});
        let stored = JsonDictField::to_db(Some(&value)).unwrap();
        let map = JsonDictField::from_db(&stored).unwrap().unwrap();
        assert_eq!(map["inputs"], serde_json::json!([1, 2]));

        assert_eq!(JsonDictField::to_db(None).unwrap(), Value::Null);
        assert!(JsonDictField::from_db(&Value::Null).unwrap().is_none());

        let err = JsonDictField::to_db(Some(&serde_json::json!([1, 2]))).unwrap_err();
        assert!(matches!(err, ChimeDbError::Validation { .. }));
        let err = JsonDictField::from_db(&Value::from("[1, 2]")).unwrap_err();
        assert!(matches!(err, ChimeDbError::Validation { .. }));
        assert!(JsonDictField::from_db(&Value::from("{not json")).is_err());
    }

    #[test]
    fn test_name_table_cache() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let connector = SqliteConnector::new(file.path().to_str().unwrap(), true);
        PROXY.initialize(connector.database().unwrap());
        PROXY
            .execute_batch(
                "CREATE TABLE telescope (id INTEGER PRIMARY KEY, name TEXT UNIQUE);
                 INSERT INTO telescope VALUES (1, 'chime'), (2, 'pathfinder');",
            )
            .unwrap();
        Telescope::clear_cache();

        let chime = Telescope::from_name("chime").unwrap();
        assert_eq!(chime.id, 1);
        assert_eq!(Telescope::from_id(1).unwrap(), chime);

        // Cached rows survive changes to the table until the cache is cleared.
        PROXY.execute("DELETE FROM telescope WHERE id = $1", &[Value::Integer(1)]).unwrap();
        assert_eq!(Telescope::from_name("chime").unwrap(), chime);
        Telescope::clear_cache();
        assert!(matches!(Telescope::from_name("chime"), Err(ChimeDbError::NotFound { .. })));

        Telescope::fill_cache().unwrap();
        assert_eq!(TELESCOPES.len(), 1);
        PROXY.execute_batch("INSERT INTO telescope VALUES (3, 'outrigger')").unwrap();
        Telescope::fill_cache().unwrap();
        assert_eq!(TELESCOPES.len(), 1);
        assert_eq!(Telescope::from_id(3).unwrap().name, "outrigger");

        Telescope::clear_cache();
        assert!(TELESCOPES.is_empty());
        connector.close();
        PROXY.reset();
    }

    #[test]
    fn test_fill_cache_on_empty_table_queries_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let connector = SqliteConnector::new(file.path().to_str().unwrap(), true);
        PROXY.initialize(connector.database().unwrap());
        PROXY.execute_batch("CREATE TABLE site (id INTEGER PRIMARY KEY, name TEXT UNIQUE)").unwrap();
        Site::clear_cache();

        Site::fill_cache().unwrap();
        assert!(SITES.is_empty());
        assert!(SITES.is_filled());

        PROXY.execute_batch("INSERT INTO site VALUES (1, 'drao')").unwrap();
        Site::fill_cache().unwrap();
        assert_eq!(SITES.len(), 0);
        assert_eq!(Site::from_name("drao").unwrap().id, 1);

        Site::clear_cache();
        assert!(!SITES.is_filled());
        connector.close();
        PROXY.reset();
    }

    #[test]
    #[serial]
    fn test_check_and_create_tables() {
        clean_env();
        config::test_enable();
        let table = flag_table();

        connect(false, false).unwrap();
        assert_eq!(check_tables(&[&table], false).unwrap(), vec!["dataflag".to_string()]);

        create_tables(&[&table]).unwrap();
        assert!(check_tables(&[&table], false).unwrap().is_empty());

        let bad = PROXY.execute(
            "INSERT INTO dataflag (kind, meta) VALUES ($1, $2)",
            &[Value::from("bogus"), Value::Null],
        );
        assert!(bad.is_err());

        crate::state::close();
        clean_env();
    }

    #[test]
    #[serial]
    fn test_check_tables_can_create() {
        clean_env();
        config::test_enable();
        let table = flag_table();

        assert!(check_tables(&[&table], true).unwrap().is_empty());
        assert!(PROXY.table_exists("dataflag").unwrap());

        crate::state::close();
        clean_env();
    }
}
