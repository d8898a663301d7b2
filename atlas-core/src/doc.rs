//! Document store: the authoritative, generation-versioned copy of a map.
//!
//! ```text
//!                    ""  (root, always present)
//!                 ┌───┴────┐
//!           idx "F"│        │idx "O"
//!                 f1        f2 ──► f3
//!
//!   orphans: {f9}            layers: "A" → l1, "B" → l2
//! ```
//!
//! Every applied changeset bumps the generation by one. Each stored field
//! remembers the generation that last wrote it, which is all
//! [`DocStore::changes_after`] needs to produce catch-up deltas and
//! snapshots.
//!
//! Illegal states are repaired, not rejected: cycles, dangling parents and
//! idx collisions are fixed in place and the repairs are returned to the
//! caller as a fix changeset. Only malformed input is a [`DocError`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use thiserror::Error;

use crate::changeset::Changeset;
use crate::feature::{Feature, Geometry, Layer, TriState};
use crate::frac_idx;

/// Id of the root feature.
pub const ROOT_ID: &str = "";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("bad changeset: {0}")]
    BadUpdate(String),
}

fn bad(msg: impl Into<String>) -> DocError {
    DocError::BadUpdate(msg.into())
}

/// Result of a successful [`DocStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub generation: u64,
    /// Repairs the sender does not know about yet.
    pub fixes: Option<Changeset>,
}

// ─── Stored nodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: TriState<T>,
    generation: u64,
}

impl<T> Default for Stamped<T> {
    fn default() -> Self {
        Self {
            value: TriState::Unspecified,
            generation: 0,
        }
    }
}

impl<T: Clone> Stamped<T> {
    fn apply(&mut self, generation: u64, incoming: &TriState<T>) {
        if !incoming.is_unspecified() {
            self.value = incoming.clone();
            self.generation = generation;
        }
    }

    fn set(&mut self, generation: u64, value: T) {
        self.value = TriState::Set(value);
        self.generation = generation;
    }

    fn since(&self, g0: u64) -> TriState<T> {
        if self.generation > g0 {
            self.value.clone()
        } else {
            TriState::Unspecified
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoredFeature {
    parent: Stamped<String>,
    idx: Stamped<String>,
    name: Stamped<String>,
    color: Stamped<String>,
    geometry: Stamped<Geometry>,
    imported_from_file: Stamped<String>,
}

impl StoredFeature {
    fn merge(&mut self, generation: u64, incoming: &Feature) {
        self.parent.apply(generation, &incoming.parent);
        self.idx.apply(generation, &incoming.idx);
        self.name.apply(generation, &incoming.name);
        self.color.apply(generation, &incoming.color);
        self.geometry.apply(generation, &incoming.geometry);
        self.imported_from_file.apply(generation, &incoming.imported_from_file);
    }

    fn changes_since(&self, g0: u64, id: &str) -> Option<Feature> {
        let feature = Feature {
            id: id.to_string(),
            parent: self.parent.since(g0),
            idx: self.idx.since(g0),
            name: self.name.since(g0),
            color: self.color.since(g0),
            geometry: self.geometry.since(g0),
            imported_from_file: self.imported_from_file.since(g0),
        };
        (!feature.is_blank()).then_some(feature)
    }

    fn to_feature(&self, id: &str) -> Feature {
        Feature {
            id: id.to_string(),
            parent: self.parent.value.clone(),
            idx: self.idx.value.clone(),
            name: self.name.value.clone(),
            color: self.color.value.clone(),
            geometry: self.geometry.value.clone(),
            imported_from_file: self.imported_from_file.value.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoredLayer {
    idx: Stamped<String>,
    opacity: Stamped<f64>,
}

impl StoredLayer {
    fn changes_since(&self, g0: u64, id: &str) -> Option<Layer> {
        let idx = self.idx.since(g0);
        let opacity = self.opacity.since(g0);
        if idx.is_unspecified() && opacity.is_unspecified() {
            return None;
        }
        Some(Layer {
            id: id.to_string(),
            idx,
            opacity,
        })
    }

    fn to_layer(&self, id: &str) -> Layer {
        Layer {
            id: id.to_string(),
            idx: self.idx.value.clone(),
            opacity: self.opacity.value.clone(),
        }
    }
}

// ─── Store ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DocStore {
    generation: u64,

    fadds: HashMap<String, u64>,
    fdeletes: HashMap<String, u64>,
    fnodes: HashMap<String, StoredFeature>,
    /// parent → children, ordered by id
    ftree: HashMap<String, BTreeSet<String>>,
    /// parent → idx → child
    findices: HashMap<String, BTreeMap<String, String>>,
    forphans: BTreeSet<String>,

    lnodes: HashMap<String, StoredLayer>,
    lindices: BTreeMap<String, String>,
}

impl Default for DocStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocStore {
    pub fn new() -> Self {
        let mut fnodes = HashMap::new();
        fnodes.insert(ROOT_ID.to_string(), StoredFeature::default());
        Self {
            generation: 0,
            fadds: HashMap::new(),
            fdeletes: HashMap::new(),
            fnodes,
            ftree: HashMap::new(),
            findices: HashMap::new(),
            forphans: BTreeSet::new(),
            lnodes: HashMap::new(),
            lindices: BTreeMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Raise the generation to at least `generation`. Used when replaying a
    /// log whose entries span several generations.
    pub fn fast_forward(&mut self, generation: u64) {
        self.generation = self.generation.max(generation);
    }

    /// Number of live features, root excluded.
    pub fn feature_count(&self) -> usize {
        self.fnodes.len() - 1
    }

    pub fn layer_count(&self) -> usize {
        self.lnodes.len()
    }

    pub fn feature(&self, id: &str) -> Option<Feature> {
        self.fnodes.get(id).map(|node| node.to_feature(id))
    }

    pub fn layer(&self, id: &str) -> Option<Layer> {
        self.lnodes.get(id).map(|node| node.to_layer(id))
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.fdeletes.contains_key(id)
    }

    /// Children of `parent` in idx order.
    pub fn children(&self, parent: &str) -> Vec<&str> {
        self.findices
            .get(parent)
            .map(|indices| indices.values().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Ids of features without a parent.
    pub fn orphans(&self) -> impl Iterator<Item = &str> {
        self.forphans.iter().map(String::as_str)
    }

    /// Layer ids in idx order. Layers without an idx are not listed.
    pub fn layer_order(&self) -> Vec<&str> {
        self.lindices.values().map(String::as_str).collect()
    }

    /// Visit every live feature below the root, depth first, siblings in idx
    /// order.
    pub fn traverse_features<F: FnMut(&Feature)>(&self, mut visit: F) {
        let mut stack: Vec<&str> = self.children(ROOT_ID).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.fnodes.get(id) {
                visit(&node.to_feature(id));
            }
            stack.extend(self.children(id).into_iter().rev());
        }
    }

    // ─── Writes ────────────────────────────────────────────────────────────

    /// Apply a changeset as one new generation.
    ///
    /// The whole changeset is checked first: a [`DocError`] means nothing was
    /// applied and the generation did not move.
    pub fn update(&mut self, change: &Changeset) -> Result<UpdateOutcome, DocError> {
        self.check(change)?;
        self.generation += 1;
        let mut fixes = Changeset::new();

        let mut seen = HashSet::new();
        for id in &change.fdelete {
            self.delete_subtree(id, &change.fdelete, &mut seen, &mut fixes);
        }

        let mut added: HashSet<&str> = HashSet::with_capacity(change.fadd.len());
        for id in &change.fadd {
            if !added.insert(id.as_str()) {
                continue;
            }
            if let Some(incoming) = change.fset.get(id) {
                self.set_feature(id, incoming, true, &mut fixes)?;
            }
        }

        for (id, incoming) in &change.fset {
            if added.contains(id.as_str()) {
                continue;
            }
            self.set_feature(id, incoming, false, &mut fixes)?;
        }

        for (id, incoming) in &change.lset {
            self.set_layer(id, incoming, &mut fixes)?;
        }

        Ok(UpdateOutcome {
            generation: self.generation,
            fixes: (!fixes.is_empty()).then_some(fixes),
        })
    }

    fn check(&self, change: &Changeset) -> Result<(), DocError> {
        if change.fdelete.contains(ROOT_ID) {
            return Err(bad("cannot delete the root feature"));
        }
        let adds: HashSet<&str> = change.fadd.iter().map(String::as_str).collect();
        if adds.iter().any(|id| !change.fset.contains_key(*id)) {
            return Err(bad("missing fset for fadd"));
        }

        for (id, incoming) in &change.fset {
            if incoming.id != *id {
                return Err(bad(format!("fset key {id:?} does not match feature id {:?}", incoming.id)));
            }
            if id == ROOT_ID && (!incoming.parent.is_unspecified() || !incoming.idx.is_unspecified()) {
                return Err(bad("cannot move the root feature"));
            }
            if incoming.parent.get() == Some(id) {
                return Err(bad("parent cannot be self"));
            }
            check_idx(&incoming.idx)?;

            // Sets on tombstoned features are dropped later, not rejected.
            let known = adds.contains(id.as_str())
                || self.fnodes.contains_key(id)
                || self.fdeletes.contains_key(id)
                || change.fdelete.contains(id);
            if !known {
                return Err(bad(format!("fset for unknown feature {id:?}")));
            }
        }

        for (id, incoming) in &change.lset {
            if incoming.id != *id {
                return Err(bad(format!("lset key {id:?} does not match layer id {:?}", incoming.id)));
            }
            check_idx(&incoming.idx)?;
        }
        Ok(())
    }

    /// Tombstone `id` and every known descendant. Deletions the caller did
    /// not ask for are reported in `fixes`.
    fn delete_subtree(
        &mut self,
        id: &str,
        requested: &BTreeSet<String>,
        seen: &mut HashSet<String>,
        fixes: &mut Changeset,
    ) {
        let g = self.generation;
        let mut stack = vec![id.to_string()];
        while let Some(fid) = stack.pop() {
            if !seen.insert(fid.clone()) {
                continue;
            }
            self.fadds.remove(&fid);
            if let Some(node) = self.fnodes.remove(&fid) {
                self.detach(&fid, &node);
            }
            if let Some(children) = self.ftree.remove(&fid) {
                stack.extend(children);
            }
            self.findices.remove(&fid);
            if !requested.contains(&fid) {
                fixes.delete_feature(fid.clone());
            }
            self.fdeletes.insert(fid, g);
        }
    }

    /// Write one feature. Input was validated by [`Self::check`].
    fn set_feature(&mut self, id: &str, incoming: &Feature, is_add: bool, fixes: &mut Changeset) -> Result<(), DocError> {
        let g = self.generation;
        let prev = match self.fnodes.get(id) {
            Some(node) => Some(node.clone()),
            None if is_add => None,
            None if self.fdeletes.contains_key(id) => {
                log::debug!("dropping fset for deleted feature {id:?}");
                fixes.delete_feature(id);
                return Ok(());
            }
            None => return Err(bad(format!("fset for unknown feature {id:?}"))),
        };

        let mut next = prev.clone().unwrap_or_default();
        next.merge(g, incoming);
        let mut fix = Feature::new(id);
        let mut fresh_idx = false;

        if let Some(parent) = next.parent.value.get().cloned() {
            if !self.fnodes.contains_key(&parent) {
                if self.fdeletes.contains_key(&parent) {
                    log::debug!("feature {id:?} moved under deleted parent {parent:?}, deleting it");
                    self.delete_orphaned_write(id, prev.is_some(), fixes);
                    return Ok(());
                }
                log::debug!("feature {id:?} has unknown parent {parent:?}, moving to root");
                next.parent.set(g, ROOT_ID.to_string());
                fix.parent = TriState::Set(ROOT_ID.to_string());
                fresh_idx = true;
            } else if self.is_ancestor_or_self(id, &parent) {
                log::debug!("moving {id:?} under {parent:?} would create a cycle, moving to root");
                next.parent.set(g, ROOT_ID.to_string());
                fix.parent = TriState::Set(ROOT_ID.to_string());
                fresh_idx = true;
            }
        }

        if let Some(parent) = next.parent.value.get().cloned() {
            let siblings = self.findices.get(&parent);
            let current = next.idx.value.get().filter(|_| !fresh_idx).cloned();
            let (idx, repaired) = place_idx(siblings, id, current)?;
            if repaired {
                log::debug!("assigned idx {idx:?} to {id:?} under {parent:?}");
                next.idx.set(g, idx.clone());
                fix.idx = TriState::Set(idx);
            }
        }

        // Infallible from here on.
        if let Some(prev) = &prev {
            self.detach(id, prev);
        }
        self.attach(id, &next);
        self.fnodes.insert(id.to_string(), next);
        if prev.is_none() {
            self.fdeletes.remove(id);
            self.fadds.insert(id.to_string(), g);
        }
        if !fix.is_blank() {
            fixes.set_feature(fix);
        }
        Ok(())
    }

    /// A write landed under a parent that is already deleted: the feature
    /// follows its parent.
    fn delete_orphaned_write(&mut self, id: &str, existed: bool, fixes: &mut Changeset) {
        if existed {
            let requested = BTreeSet::new();
            self.delete_subtree(id, &requested, &mut HashSet::new(), fixes);
        } else {
            self.fdeletes.insert(id.to_string(), self.generation);
            fixes.delete_feature(id);
        }
    }

    /// True when `id` is `node` or one of its ancestors.
    fn is_ancestor_or_self(&self, id: &str, node: &str) -> bool {
        let mut current = node;
        // Bounded walk: a corrupt tree must not hang the actor.
        for _ in 0..=self.fnodes.len() {
            if current == id {
                return true;
            }
            match self.fnodes.get(current).and_then(|n| n.parent.value.get()) {
                Some(parent) if current != ROOT_ID => current = parent,
                _ => return false,
            }
        }
        true
    }

    fn attach(&mut self, id: &str, node: &StoredFeature) {
        if id == ROOT_ID {
            return;
        }
        match node.parent.value.get() {
            Some(parent) => {
                self.ftree.entry(parent.clone()).or_default().insert(id.to_string());
                if let Some(idx) = node.idx.value.get() {
                    self.findices
                        .entry(parent.clone())
                        .or_default()
                        .insert(idx.clone(), id.to_string());
                }
            }
            None => {
                self.forphans.insert(id.to_string());
            }
        }
    }

    fn detach(&mut self, id: &str, node: &StoredFeature) {
        if id == ROOT_ID {
            return;
        }
        match node.parent.value.get() {
            Some(parent) => {
                if let Some(children) = self.ftree.get_mut(parent) {
                    children.remove(id);
                    if children.is_empty() {
                        self.ftree.remove(parent);
                    }
                }
                if let (Some(idx), Some(indices)) = (node.idx.value.get(), self.findices.get_mut(parent)) {
                    if indices.get(idx).map(String::as_str) == Some(id) {
                        indices.remove(idx);
                    }
                    if indices.is_empty() {
                        self.findices.remove(parent);
                    }
                }
            }
            None => {
                self.forphans.remove(id);
            }
        }
    }

    fn set_layer(&mut self, id: &str, incoming: &Layer, fixes: &mut Changeset) -> Result<(), DocError> {
        let g = self.generation;
        let prev = self.lnodes.get(id).cloned();
        let mut next = prev.clone().unwrap_or_default();
        next.idx.apply(g, &incoming.idx);
        next.opacity.apply(g, &incoming.opacity);

        if let Some(current) = next.idx.value.get().cloned() {
            let (idx, repaired) = place_idx(Some(&self.lindices), id, Some(current))?;
            if repaired {
                log::debug!("layer idx collision, moved {id:?} to {idx:?}");
                next.idx.set(g, idx.clone());
                fixes.set_layer(Layer::new(id).with_idx(idx));
            }
        }

        if let Some(idx) = prev.as_ref().and_then(|p| p.idx.value.get()) {
            if self.lindices.get(idx).map(String::as_str) == Some(id) {
                self.lindices.remove(idx);
            }
        }
        if let Some(idx) = next.idx.value.get() {
            self.lindices.insert(idx.clone(), id.to_string());
        }
        self.lnodes.insert(id.to_string(), next);
        Ok(())
    }

    // ─── Reads ─────────────────────────────────────────────────────────────

    /// Everything that changed after generation `g0`, or `None` when nothing
    /// did. `changes_after(0)` is a full snapshot.
    pub fn changes_after(&self, g0: u64) -> (u64, Option<Changeset>) {
        if g0 == self.generation {
            return (self.generation, None);
        }

        let mut out = Changeset::new();
        out.fdelete = self
            .fdeletes
            .iter()
            .filter(|(_, g)| **g > g0)
            .map(|(id, _)| id.clone())
            .collect();

        self.collect_subtree(g0, ROOT_ID, &mut out);
        for orphan in &self.forphans {
            self.collect_subtree(g0, orphan, &mut out);
        }

        for (id, node) in &self.lnodes {
            if let Some(layer) = node.changes_since(g0, id) {
                out.lset.insert(id.clone(), layer);
            }
        }

        (self.generation, (!out.is_empty()).then_some(out))
    }

    fn collect_subtree(&self, g0: u64, start: &str, out: &mut Changeset) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if self.fadds.get(id).is_some_and(|g| *g > g0) {
                out.fadd.push(id.to_string());
                out.fset.insert(id.to_string(), Feature::new(id));
            }
            if let Some(changed) = self.fnodes.get(id).and_then(|node| node.changes_since(g0, id)) {
                out.fset.insert(id.to_string(), changed);
            }
            if let Some(children) = self.ftree.get(id) {
                stack.extend(children.iter().rev().map(String::as_str));
            }
        }
    }
}

fn check_idx(idx: &TriState<String>) -> Result<(), DocError> {
    match idx {
        TriState::Set(idx) => frac_idx::validate(idx).map_err(|e| bad(format!("invalid idx {idx:?}: {e}"))),
        _ => Ok(()),
    }
}

/// Pick an idx for `id` among `siblings`.
///
/// Keeps `current` when it is free, puts the entry first when there is none,
/// and otherwise moves it just after the sibling it collides with. Returns
/// the idx and whether it differs from `current`.
fn place_idx(
    siblings: Option<&BTreeMap<String, String>>,
    id: &str,
    current: Option<String>,
) -> Result<(String, bool), DocError> {
    let repaired = match current {
        None => {
            let first = other_idxs(siblings, id, Bound::Unbounded).next().unwrap_or("");
            frac_idx::between_static("", first)
        }
        Some(idx) => {
            let taken = siblings
                .and_then(|s| s.get(&idx))
                .is_some_and(|owner| owner != id);
            if !taken {
                return Ok((idx, false));
            }
            let next = other_idxs(siblings, id, Bound::Excluded(idx.as_str()))
                .next()
                .unwrap_or("");
            frac_idx::between_static(&idx, next)
        }
    };
    repaired
        .map(|idx| (idx, true))
        .map_err(|e| bad(format!("stored idx is corrupt: {e}")))
}

/// Sibling idxs above `lower` in order, skipping the one owned by `id`.
fn other_idxs<'a>(
    siblings: Option<&'a BTreeMap<String, String>>,
    id: &'a str,
    lower: Bound<&'a str>,
) -> impl Iterator<Item = &'a str> + 'a {
    siblings
        .into_iter()
        .flat_map(move |s| s.range::<str, _>((lower, Bound::Unbounded)))
        .filter(move |(_, owner)| owner.as_str() != id)
        .map(|(idx, _)| idx.as_str())
}
