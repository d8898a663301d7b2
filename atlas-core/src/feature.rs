//! Features, layers and the tri-state field model.
//!
//! Every field except `id` is a [`TriState`]. On the wire a missing field is
//! `Unspecified`, `null` is `Unset` and any other value is `Set`:
//!
//! ```text
//! {"id": "f1", "name": "Summit", "color": null}
//!   parent    → Unspecified  (leave as is)
//!   name      → Set("Summit")
//!   color     → Unset        (clear it)
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A field delta: no opinion, explicitly cleared, or a new value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TriState<T> {
    #[default]
    Unspecified,
    Unset,
    Set(T),
}

impl<T> TriState<T> {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, TriState::Unspecified)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, TriState::Set(_))
    }

    /// The value if `Set`.
    pub fn get(&self) -> Option<&T> {
        match self {
            TriState::Set(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone> TriState<T> {
    /// Later opinion wins. `Unspecified` leaves `self` untouched.
    pub fn overlay(&mut self, incoming: &TriState<T>) {
        if !incoming.is_unspecified() {
            *self = incoming.clone();
        }
    }
}

impl<T: Serialize> Serialize for TriState<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TriState::Set(v) => serializer.serialize_some(v),
            // Unspecified fields are skipped by the containing struct.
            _ => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for TriState<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => TriState::Set(v),
            None => TriState::Unset,
        })
    }
}

/// `[lng, lat]` in degrees.
pub type LngLat = [f64; 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(LngLat),
    LineString(Vec<LngLat>),
}

/// A (partial) feature as carried in a changeset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub parent: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub idx: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub name: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub color: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub geometry: TriState<Geometry>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub imported_from_file: TriState<String>,
}

impl Feature {
    /// A feature delta with only the id filled in.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A new child of `parent` at `idx`.
    pub fn child(id: impl Into<String>, parent: impl Into<String>, idx: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: TriState::Set(parent.into()),
            idx: TriState::Set(idx.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = TriState::Set(name.into());
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = TriState::Set(geometry);
        self
    }

    /// Field-wise overlay of `incoming` onto `self`.
    pub fn merge(&mut self, incoming: &Feature) {
        self.parent.overlay(&incoming.parent);
        self.idx.overlay(&incoming.idx);
        self.name.overlay(&incoming.name);
        self.color.overlay(&incoming.color);
        self.geometry.overlay(&incoming.geometry);
        self.imported_from_file.overlay(&incoming.imported_from_file);
    }

    /// True when no field carries an opinion.
    pub fn is_blank(&self) -> bool {
        self.parent.is_unspecified()
            && self.idx.is_unspecified()
            && self.name.is_unspecified()
            && self.color.is_unspecified()
            && self.geometry.is_unspecified()
            && self.imported_from_file.is_unspecified()
    }
}

/// A (partial) layer as carried in a changeset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub idx: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub opacity: TriState<f64>,
}

impl Layer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_idx(mut self, idx: impl Into<String>) -> Self {
        self.idx = TriState::Set(idx.into());
        self
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = TriState::Set(opacity);
        self
    }

    pub fn merge(&mut self, incoming: &Layer) {
        self.idx.overlay(&incoming.idx);
        self.opacity.overlay(&incoming.opacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_json_encoding() {
        let f: Feature = serde_json::from_str(r#"{"id":"f1","name":"Summit","color":null}"#).unwrap();
        assert_eq!(f.parent, TriState::Unspecified);
        assert_eq!(f.name, TriState::Set("Summit".to_string()));
        assert_eq!(f.color, TriState::Unset);

        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json, serde_json::json!({"id": "f1", "name": "Summit", "color": null}));
    }

    #[test]
    fn test_overlay_later_wins() {
        let mut base = Feature::new("f1").with_name("a");
        base.merge(&Feature {
            color: TriState::Set("#f00".into()),
            ..Feature::new("f1")
        });
        assert_eq!(base.name.get().map(String::as_str), Some("a"));

        base.merge(&Feature {
            name: TriState::Unset,
            ..Feature::new("f1")
        });
        assert_eq!(base.name, TriState::Unset);
        assert_eq!(base.color, TriState::Set("#f00".to_string()));
    }

    #[test]
    fn test_geometry_encoding() {
        let f = Feature::new("f1").with_geometry(Geometry::LineString(vec![[1.0, 2.0], [3.0, 4.0]]));
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(
            json,
            r#"{"id":"f1","geometry":{"type":"LineString","coordinates":[[1.0,2.0],[3.0,4.0]]}}"#
        );
        let back: Feature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_imported_from_file_is_camel_case() {
        let f: Feature = serde_json::from_str(r#"{"id":"f1","importedFromFile":"trip.gpx"}"#).unwrap();
        assert_eq!(f.imported_from_file, TriState::Set("trip.gpx".to_string()));
        assert!(!f.is_blank());
        assert!(Feature::new("f2").is_blank());
    }
}
