//! Changesets: the unit of mutation, sync and persistence.
//!
//! A changeset is a batch of feature deletes, ordered feature adds, partial
//! feature sets and partial layer sets. Merging is associative, so the server
//! can fold any number of client changesets (and its own fixes) into one
//! broadcast.
//!
//! Wire format (JSON):
//! ```text
//! {
//!   "fdelete": ["f3"],
//!   "fadd":    ["f1", "f2"],            // parents before children, deduplicated
//!   "fset":    {"f1": {...}, "f2": {...}},
//!   "lset":    {"l1": {"id": "l1", "opacity": 0.5}}
//! }
//! ```
//! Empty parts are omitted.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::feature::{Feature, Layer};

#[derive(Error, Debug)]
pub enum ChangesetError {
    #[error("serialized changeset exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("changeset json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    /// Deleting a feature deletes all its known descendants.
    pub fdelete: BTreeSet<String>,
    /// New feature ids, parents before their newly added children. May
    /// contain duplicates until serialized.
    pub fadd: Vec<String>,
    pub fset: BTreeMap<String, Feature>,
    pub lset: BTreeMap<String, Layer>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fdelete.is_empty() && self.fadd.is_empty() && self.fset.is_empty() && self.lset.is_empty()
    }

    /// Add a new feature. The feature must carry its own id.
    pub fn add_feature(&mut self, feature: Feature) -> &mut Self {
        self.fadd.push(feature.id.clone());
        self.set_feature(feature)
    }

    /// Overlay a partial feature onto any pending set for the same id.
    pub fn set_feature(&mut self, feature: Feature) -> &mut Self {
        match self.fset.get_mut(&feature.id) {
            Some(existing) => existing.merge(&feature),
            None => {
                self.fset.insert(feature.id.clone(), feature);
            }
        }
        self
    }

    pub fn delete_feature(&mut self, id: impl Into<String>) -> &mut Self {
        self.fdelete.insert(id.into());
        self
    }

    pub fn set_layer(&mut self, layer: Layer) -> &mut Self {
        match self.lset.get_mut(&layer.id) {
            Some(existing) => existing.merge(&layer),
            None => {
                self.lset.insert(layer.id.clone(), layer);
            }
        }
        self
    }

    /// Merge `incoming` into `self`: deletes are unioned, adds concatenated
    /// and sets overlaid field by field.
    pub fn merge(&mut self, incoming: &Changeset) {
        self.fdelete.extend(incoming.fdelete.iter().cloned());
        self.fadd.extend(incoming.fadd.iter().cloned());
        for feature in incoming.fset.values() {
            self.set_feature(feature.clone());
        }
        for layer in incoming.lset.values() {
            self.set_layer(layer.clone());
        }
    }

    /// Merge an optional changeset, as produced by the document store.
    pub fn merge_opt(&mut self, incoming: Option<&Changeset>) {
        if let Some(incoming) = incoming {
            self.merge(incoming);
        }
    }

    /// `fadd` in first-seen order without duplicates.
    pub fn unique_adds(&self) -> Vec<&str> {
        let mut seen = HashSet::with_capacity(self.fadd.len());
        self.fadd
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Stream the JSON encoding into `writer`, failing as soon as more than
    /// `limit` bytes would be written. Returns the number of bytes written.
    pub fn write_json_bounded<W: Write>(&self, writer: W, limit: usize) -> Result<usize, ChangesetError> {
        let mut bounded = BoundedWriter {
            inner: writer,
            written: 0,
            limit,
        };
        match serde_json::to_writer(&mut bounded, self) {
            Ok(()) => Ok(bounded.written),
            Err(_) if bounded.written > limit => Err(ChangesetError::TooLarge { limit }),
            Err(e) => Err(e.into()),
        }
    }

    /// JSON encoding, capped at `limit` bytes.
    pub fn to_json_bounded(&self, limit: usize) -> Result<Vec<u8>, ChangesetError> {
        let mut out = Vec::new();
        self.write_json_bounded(&mut out, limit)?;
        Ok(out)
    }
}

/// Counts bytes and refuses writes past the limit.
struct BoundedWriter<W> {
    inner: W,
    written: usize,
    limit: usize,
}

impl<W: Write> Write for BoundedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written += buf.len();
        if self.written > self.limit {
            return Err(std::io::Error::other("size limit exceeded"));
        }
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Serialize)]
struct ChangesetRef<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fdelete: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fadd: Vec<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fset: &'a BTreeMap<String, Feature>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    lset: &'a BTreeMap<String, Layer>,
}

#[derive(Deserialize)]
struct ChangesetDto {
    #[serde(default)]
    fdelete: Option<Vec<String>>,
    #[serde(default)]
    fadd: Option<Vec<String>>,
    #[serde(default)]
    fset: Option<BTreeMap<String, Feature>>,
    #[serde(default)]
    lset: Option<BTreeMap<String, Layer>>,
}

impl Serialize for Changeset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ChangesetRef {
            fdelete: self.fdelete.iter().map(String::as_str).collect(),
            fadd: self.unique_adds(),
            fset: &self.fset,
            lset: &self.lset,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Changeset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dto = ChangesetDto::deserialize(deserializer)?;
        Ok(Changeset {
            fdelete: dto.fdelete.unwrap_or_default().into_iter().collect(),
            fadd: dto.fadd.unwrap_or_default(),
            fset: dto.fset.unwrap_or_default(),
            lset: dto.lset.unwrap_or_default(),
        })
    }
}
