//! Hierarchical key/value persistence
//!
//! State is kept as a tree of sections, each holding scalar values and child
//! sections. A [`Section`] is a cheap handle scoped to one path in the tree;
//! reading never creates anything, writing creates missing sections on the
//! way down. The whole tree is saved to and loaded from a JSON file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Missing key {key} in section {section}")]
    MissingKey { section: String, key: String },
    #[error("Key {key} in section {section} is not a valid {expected}")]
    WrongType {
        section: String,
        key: String,
        expected: &'static str,
    },
}

/// A scalar stored in a section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Str(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One node of the section tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionData {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sections: BTreeMap<String, SectionData>,
}

impl SectionData {
    fn walk(&self, path: &[String]) -> Option<&SectionData> {
        path.iter()
            .try_fold(self, |data, name| data.sections.get(name))
    }

    fn walk_mut(&mut self, path: &[String]) -> Option<&mut SectionData> {
        path.iter()
            .try_fold(self, |data, name| data.sections.get_mut(name))
    }

    fn walk_or_create(&mut self, path: &[String]) -> &mut SectionData {
        path.iter().fold(self, |data, name| {
            data.sections.entry(name.clone()).or_default()
        })
    }
}

/// Shared persistent state tree
#[derive(Debug, Clone, Default)]
pub struct Store {
    root: Arc<RwLock<SectionData>>,
}

impl Store {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a file
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let data: SectionData = serde_json::from_str(&content)?;
        Ok(Self {
            root: Arc::new(RwLock::new(data)),
        })
    }

    /// Load a store or create a new one if the file doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save the whole tree to a file
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let content = {
            let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*root)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Handle to the root section
    pub fn root(&self) -> Section {
        Section {
            root: self.root.clone(),
            path: Vec::new(),
        }
    }

    /// Shorthand for `root().section(name)`
    pub fn section(&self, name: &str) -> Section {
        self.root().section(name)
    }
}

/// Handle to one section of a [`Store`]
#[derive(Debug, Clone)]
pub struct Section {
    root: Arc<RwLock<SectionData>>,
    path: Vec<String>,
}

impl Section {
    /// Child section handle (created lazily on first write)
    pub fn section(&self, name: &str) -> Section {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Section {
            root: self.root.clone(),
            path,
        }
    }

    /// Slash-separated path of this section
    pub fn path(&self) -> String {
        self.path.join("/")
    }

    fn read(&self) -> RwLockReadGuard<'_, SectionData> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SectionData> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exists(&self) -> bool {
        self.read().walk(&self.path).is_some()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let mut root = self.write();
        root.walk_or_create(&self.path)
            .values
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read()
            .walk(&self.path)
            .and_then(|data| data.values.get(key).cloned())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn require(&self, key: &str) -> Result<Value, StoreError> {
        self.get(key).ok_or_else(|| StoreError::MissingKey {
            section: self.path(),
            key: key.to_string(),
        })
    }

    fn wrong_type(&self, key: &str, expected: &'static str) -> StoreError {
        StoreError::WrongType {
            section: self.path(),
            key: key.to_string(),
            expected,
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        match self.require(key)? {
            Value::Bool(v) => Ok(v),
            _ => Err(self.wrong_type(key, "bool")),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, StoreError> {
        match self.require(key)? {
            Value::UInt(v) => Ok(v),
            Value::Int(v) => u64::try_from(v).map_err(|_| self.wrong_type(key, "unsigned integer")),
            _ => Err(self.wrong_type(key, "unsigned integer")),
        }
    }

    /// Read an unsigned integer narrowed to `T`, failing if it doesn't fit
    pub fn get_uint<T: TryFrom<u64>>(&self, key: &str) -> Result<T, StoreError> {
        let v = self.get_u64(key)?;
        T::try_from(v).map_err(|_| self.wrong_type(key, std::any::type_name::<T>()))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, StoreError> {
        match self.require(key)? {
            Value::Int(v) => Ok(v),
            Value::UInt(v) => i64::try_from(v).map_err(|_| self.wrong_type(key, "signed integer")),
            _ => Err(self.wrong_type(key, "signed integer")),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String, StoreError> {
        match self.require(key)? {
            Value::Str(v) => Ok(v),
            _ => Err(self.wrong_type(key, "string")),
        }
    }

    /// Keys of the scalar values held directly in this section
    pub fn keys(&self) -> Vec<String> {
        self.read()
            .walk(&self.path)
            .map(|data| data.values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the child sections
    pub fn sections(&self) -> Vec<String> {
        self.read()
            .walk(&self.path)
            .map(|data| data.sections.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delete_key(&self, key: &str) -> bool {
        let mut root = self.write();
        match root.walk_mut(&self.path) {
            Some(data) => data.values.remove(key).is_some(),
            None => false,
        }
    }

    /// Remove this section and everything below it
    pub fn delete(&self) -> bool {
        let Some((name, parent)) = self.path.split_last() else {
            let mut root = self.write();
            let existed = *root != SectionData::default();
            *root = SectionData::default();
            return existed;
        };
        let mut root = self.write();
        match root.walk_mut(parent) {
            Some(data) => data.sections.remove(name).is_some(),
            None => false,
        }
    }
}
