//! Configuration datastore access.
//!
//! The backend only ever reads datastores through the [`Datastore`] trait: NACM
//! fetches its rule tree from `running` on every check, and `get-config` reads
//! whichever datastore the client names. Two implementations are provided:
//!
//! - [`MemoryDatastore`]: trees held in memory, for embedding and tests.
//! - [`FileDatastore`]: one XML file per datastore, named `<db>_db`, read
//!   fresh on every access so external edits are seen immediately.
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
};

use log::trace;
use thiserror::Error;

use crate::xml::{XmlError, XmlNode};

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("datastore '{0}' does not exist")]
    Unknown(String),

    #[error("reading datastore '{db}': {source}")]
    Io { db: String, source: io::Error },

    #[error("datastore '{db}' is not valid xml: {source}")]
    Parse { db: String, source: XmlError },

    #[error("datastore lock poisoned")]
    Poisoned,
}

pub trait Datastore: Send + Sync {
    /// Reads `db`, keeping only the branches leading to `path`.
    ///
    /// The returned tree is rooted like a parsed document. An empty path
    /// returns the whole datastore.
    fn get(&self, db: &str, path: &str) -> Result<XmlNode, DatastoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDatastore {
    dbs: RwLock<HashMap<String, XmlNode>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole content of `db`.
    pub fn put(&self, db: &str, tree: XmlNode) -> Result<(), DatastoreError> {
        let mut dbs = self.dbs.write().map_err(|_| DatastoreError::Poisoned)?;
        dbs.insert(db.to_string(), tree);
        Ok(())
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, db: &str, path: &str) -> Result<XmlNode, DatastoreError> {
        let dbs = self.dbs.read().map_err(|_| DatastoreError::Poisoned)?;
        let tree = dbs
            .get(db)
            .ok_or_else(|| DatastoreError::Unknown(db.to_string()))?;
        Ok(tree.select(path))
    }
}

#[derive(Debug, Clone)]
pub struct FileDatastore {
    dir: PathBuf,
}

impl FileDatastore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, db: &str) -> PathBuf {
        self.dir.join(format!("{db}_db"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replaces the whole content of `db`.
    pub fn put(&self, db: &str, tree: &XmlNode) -> Result<(), DatastoreError> {
        fs::write(self.path(db), tree.to_string()).map_err(|source| DatastoreError::Io {
            db: db.to_string(),
            source,
        })
    }
}

impl Datastore for FileDatastore {
    fn get(&self, db: &str, path: &str) -> Result<XmlNode, DatastoreError> {
        let file = self.path(db);
        trace!("reading {} for '{path}'", file.display());

        let text = fs::read_to_string(&file).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => DatastoreError::Unknown(db.to_string()),
            _ => DatastoreError::Io {
                db: db.to_string(),
                source,
            },
        })?;
        let tree = XmlNode::parse(&text).map_err(|source| DatastoreError::Parse {
            db: db.to_string(),
            source,
        })?;
        Ok(tree.select(path))
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    const RUNNING: &str =
        "<nacm><enable-nacm>true</enable-nacm></nacm><interfaces><interface>eth0</interface></interfaces>";

    #[test]
    fn memory_get_selects_path() {
        let store = MemoryDatastore::new();
        store.put("running", XmlNode::parse(RUNNING).unwrap()).unwrap();

        let nacm = store.get("running", "nacm").unwrap();
        assert!(nacm.child("nacm").is_some());
        assert!(nacm.child("interfaces").is_none());

        let all = store.get("running", "").unwrap();
        assert_eq!(all.children().len(), 2);
    }

    #[test]
    fn memory_unknown_datastore() {
        let store = MemoryDatastore::new();
        assert!(matches!(
            store.get("candidate", ""),
            Err(DatastoreError::Unknown(_))
        ));
    }

    #[test]
    fn file_read_after_write() {
        let temp = TempDir::new("datastore").unwrap();
        let store = FileDatastore::new(temp.path());

        store.put("running", &XmlNode::parse(RUNNING).unwrap()).unwrap();
        assert_eq!(
            store.get("running", "nacm").unwrap().find_all("nacm/enable-nacm").len(),
            1
        );

        store
            .put("running", &XmlNode::parse("<interfaces/>").unwrap())
            .unwrap();
        assert!(store.get("running", "nacm").unwrap().children().is_empty());
    }

    #[test]
    fn file_missing_and_corrupt() {
        let temp = TempDir::new("datastore").unwrap();
        let store = FileDatastore::new(temp.path());

        assert!(matches!(
            store.get("startup", ""),
            Err(DatastoreError::Unknown(_))
        ));

        fs::write(store.path("running"), "<nacm>").unwrap();
        assert!(matches!(
            store.get("running", "nacm"),
            Err(DatastoreError::Parse { .. })
        ));
    }
}
