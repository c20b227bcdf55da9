//! Card storage: the collaborator that owns cards and their priority tags.
//!
//! The pipeline only reads card fields and rewrites `prio:N` tags; everything else
//! about a collection lives behind [`ItemStore`]. [`SqliteItemStore`] is the
//! persistent implementation used by the CLI, [`MemoryItemStore`] backs tests and
//! embedders that already hold their cards in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::grouping::PATH_DELIMITER;

/// Card identifier.
pub type ItemId = i64;

// =============================================================================
// Types
// =============================================================================

/// Four-tier priority label; `One` is the most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    One,
    Two,
    Three,
    Four,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::One, Priority::Two, Priority::Three, Priority::Four];

    /// The allowed-set filter: only 1..=4 map to a priority.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(Priority::One),
            2 => Some(Priority::Two),
            3 => Some(Priority::Three),
            4 => Some(Priority::Four),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        match self {
            Priority::One => 1,
            Priority::Two => 2,
            Priority::Three => 3,
            Priority::Four => 4,
        }
    }

    /// Tag form stored on the card, e.g. `prio:2`.
    pub fn tag(self) -> &'static str {
        match self {
            Priority::One => "prio:1",
            Priority::Two => "prio:2",
            Priority::Three => "prio:3",
            Priority::Four => "prio:4",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.tag() == tag)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// A card as stored: identifier, collection path, ordered fields, tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub path: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Item {
    pub fn new(id: ItemId, path: impl Into<String>, question: &str, answer: &str) -> Self {
        Self {
            id,
            path: path.into(),
            fields: vec![question.to_string(), answer.to_string()],
            tags: Vec::new(),
        }
    }

    /// First field (front / question).
    pub fn question(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Second field (back / answer); empty for single-field cards.
    pub fn answer(&self) -> &str {
        self.fields.get(1).map(String::as_str).unwrap_or("")
    }

    /// Current priority, if the card carries one.
    pub fn priority(&self) -> Option<Priority> {
        self.tags.iter().find_map(|t| Priority::from_tag(t))
    }

    pub fn has_priority(&self) -> bool {
        self.priority().is_some()
    }

    /// Replace any priority tag with exactly `priority`.
    pub fn set_priority(&mut self, priority: Priority) {
        self.tags.retain(|t| Priority::from_tag(t).is_none());
        self.tags.push(priority.tag().to_string());
    }
}

/// Per-priority card counts for one collection path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelCounts {
    pub total: usize,
    pub unlabeled: usize,
    pub by_priority: BTreeMap<u8, usize>,
}

impl LabelCounts {
    pub fn labeled(&self) -> usize {
        self.total - self.unlabeled
    }

    fn add(&mut self, item: &Item) {
        self.total += 1;
        match item.priority() {
            Some(p) => *self.by_priority.entry(p.value()).or_default() += 1,
            None => self.unlabeled += 1,
        }
    }
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Cards in `path` and in every path below it, ordered by id.
    async fn find_items_by_path(&self, path: &str) -> Result<Vec<ItemId>, StoreError>;

    async fn get_item(&self, id: ItemId) -> Result<Item, StoreError>;

    /// Persist `item` (fields and tags).
    async fn update_item(&self, item: &Item) -> Result<(), StoreError>;

    /// Collection path a card lives in.
    async fn item_path(&self, id: ItemId) -> Result<String, StoreError>;

    /// Every known collection path, including ancestors of stored paths, sorted.
    async fn list_collection_paths(&self) -> Result<Vec<String>, StoreError>;

    /// Path the user was last working in, if any.
    async fn current_path(&self) -> Result<Option<String>, StoreError>;

    /// Name shown to the model for a group.
    fn path_display_name(&self, path: &str) -> String {
        path.to_string()
    }
}

fn with_ancestors<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut all = BTreeSet::new();
    for path in paths {
        let mut current = path;
        all.insert(current.to_string());
        while let Some(idx) = current.rfind(PATH_DELIMITER) {
            current = &current[..idx];
            all.insert(current.to_string());
        }
    }
    all.into_iter().collect()
}

fn in_subtree(item_path: &str, root: &str) -> bool {
    item_path == root
        || item_path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with(PATH_DELIMITER))
}

// =============================================================================
// SQLite store
// =============================================================================

#[derive(Clone)]
pub struct SqliteItemStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteItemStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("DECKPRIO_DB") {
            return PathBuf::from(path);
        }
        PathBuf::from("deckprio.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items ( \
               id INTEGER PRIMARY KEY, \
               path TEXT NOT NULL, \
               fields TEXT NOT NULL DEFAULT '[]', \
               tags TEXT NOT NULL DEFAULT '[]' \
             ); \
             CREATE INDEX IF NOT EXISTS idx_items_path ON items(path); \
             CREATE TABLE IF NOT EXISTS meta ( \
               key TEXT PRIMARY KEY, \
               value TEXT NOT NULL \
             );",
        )?;
        Ok(())
    }

    /// Recover from mutex poisoning; the connection itself is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Insert or replace cards. Returns the number written.
    pub async fn import_items(&self, items: Vec<Item>) -> Result<usize, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for item in &items {
                tx.execute(
                    "INSERT INTO items (id, path, fields, tags) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(id) DO UPDATE SET \
                        path = excluded.path, \
                        fields = excluded.fields, \
                        tags = excluded.tags",
                    params![
                        item.id,
                        item.path,
                        serde_json::to_string(&item.fields)?,
                        serde_json::to_string(&item.tags)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(items.len())
        })
        .await
    }

    /// Load cards from a JSON-lines file, one [`Item`] per line.
    pub async fn import_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let items = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<Item>)
            .collect::<Result<Vec<_>, _>>()?;
        self.import_items(items).await
    }

    pub async fn set_current_path(&self, path: &str) -> Result<(), StoreError> {
        let path = path.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('current_path', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![path],
            )?;
            Ok(())
        })
        .await
    }

    /// Number of cards stored directly in each path.
    pub async fn path_counts(&self) -> Result<Vec<(String, usize)>, StoreError> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT path, COUNT(*) FROM items GROUP BY path ORDER BY path")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as usize))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Priority distribution for `path` and its subtree.
    pub async fn label_counts(&self, path: &str) -> Result<LabelCounts, StoreError> {
        let mut counts = LabelCounts::default();
        for id in self.find_items_by_path(path).await? {
            counts.add(&self.get_item(id).await?);
        }
        Ok(counts)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ItemId, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn find_items_by_path(&self, path: &str) -> Result<Vec<ItemId>, StoreError> {
        let exact = path.to_string();
        let prefix = format!("{path}{PATH_DELIMITER}");
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM items \
                 WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2 \
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![exact, prefix], |row| row.get::<_, ItemId>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn get_item(&self, id: ItemId) -> Result<Item, StoreError> {
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, path, fields, tags FROM items WHERE id = ?1",
                    params![id],
                    row_to_item,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("item {id}")))?;
            let (id, path, fields, tags) = row;
            Ok(Item {
                id,
                path,
                fields: serde_json::from_str(&fields)?,
                tags: serde_json::from_str(&tags)?,
            })
        })
        .await
    }

    async fn update_item(&self, item: &Item) -> Result<(), StoreError> {
        let item = item.clone();
        self.blocking(move |conn| {
            let rows = conn.execute(
                "UPDATE items SET fields = ?1, tags = ?2 WHERE id = ?3",
                params![
                    serde_json::to_string(&item.fields)?,
                    serde_json::to_string(&item.tags)?,
                    item.id
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("item {}", item.id)));
            }
            Ok(())
        })
        .await
    }

    async fn item_path(&self, id: ItemId) -> Result<String, StoreError> {
        self.blocking(move |conn| {
            conn.query_row("SELECT path FROM items WHERE id = ?1", params![id], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))
        })
        .await
    }

    async fn list_collection_paths(&self) -> Result<Vec<String>, StoreError> {
        let stored: Vec<String> = self
            .blocking(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT path FROM items")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(with_ancestors(stored.iter().map(String::as_str)))
    }

    async fn current_path(&self) -> Result<Option<String>, StoreError> {
        self.blocking(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'current_path'",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Map-backed store. Counts writes so callers can assert on persistence.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: Mutex<BTreeMap<ItemId, Item>>,
    current: Option<String>,
    writes: AtomicUsize,
}

impl MemoryItemStore {
    pub fn new(items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().map(|i| (i.id, i)).collect()),
            current: None,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_current_path(mut self, path: impl Into<String>) -> Self {
        self.current = Some(path.into());
        self
    }

    /// Number of successful `update_item` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of a card, bypassing the trait.
    pub fn snapshot(&self, id: ItemId) -> Option<Item> {
        self.lock().get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ItemId, Item>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn find_items_by_path(&self, path: &str) -> Result<Vec<ItemId>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|item| in_subtree(&item.path, path))
            .map(|item| item.id)
            .collect())
    }

    async fn get_item(&self, id: ItemId) -> Result<Item, StoreError> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))
    }

    async fn update_item(&self, item: &Item) -> Result<(), StoreError> {
        let mut items = self.lock();
        let slot = items
            .get_mut(&item.id)
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item.id)))?;
        *slot = item.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn item_path(&self, id: ItemId) -> Result<String, StoreError> {
        self.lock()
            .get(&id)
            .map(|item| item.path.clone())
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))
    }

    async fn list_collection_paths(&self) -> Result<Vec<String>, StoreError> {
        let items = self.lock();
        Ok(with_ancestors(items.values().map(|i| i.path.as_str())))
    }

    async fn current_path(&self) -> Result<Option<String>, StoreError> {
        Ok(self.current.clone())
    }
}
