//! Core document model for collaborative map editing.
//!
//! ```text
//!   client edits ──► Changeset ──► DocStore::update ──► fixes
//!                        ▲               │
//!                        │               ▼
//!                        └──── DocStore::changes_after(g) ──► peers, log
//! ```
//!
//! Everything here is synchronous and single-threaded. Concurrency lives in
//! `atlas-sync`, which owns one [`DocStore`] per document inside an actor.

pub mod aware;
pub mod changeset;
pub mod doc;
pub mod feature;
pub mod frac_idx;

pub use aware::{Aware, Camera};
pub use changeset::{Changeset, ChangesetError};
pub use doc::{DocError, DocStore, UpdateOutcome, ROOT_ID};
pub use feature::{Feature, Geometry, Layer, LngLat, TriState};
