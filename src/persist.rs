//! Hand-off of accepted collections to storage.

use crate::collection::Collection;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Receives each accepted collection once, under its unique id.
pub trait CollectionSink {
    fn save(&mut self, id: &str, collection: &Collection) -> Result<()>;
}

impl CollectionSink for Vec<Collection> {
    fn save(&mut self, _id: &str, collection: &Collection) -> Result<()> {
        self.push(collection.clone());
        Ok(())
    }
}

/// Writes `collection_<id>.json` files into a directory.
#[derive(Debug, Clone)]
pub struct JsonDirectorySink {
    dir: PathBuf,
}

impl JsonDirectorySink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
            .collect();
        self.dir.join(format!("collection_{safe}.json"))
    }
}

impl CollectionSink for JsonDirectorySink {
    fn save(&mut self, id: &str, collection: &Collection) -> Result<()> {
        let path = self.path_for(id);
        fs::write(&path, serde_json::to_string_pretty(collection)?)?;
        log::debug!("Saved collection {} to {}", id, path.display());
        Ok(())
    }
}

pub fn load_collection<P: AsRef<Path>>(path: P) -> Result<Collection> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Every `collection_*.json` in `dir`, in filename order.
pub fn load_collection_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<Collection>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if name.starts_with("collection_") && name.ends_with(".json") {
            paths.push(path);
        }
    }
    paths.sort();
    paths.iter().map(load_collection).collect()
}
