//! Ephemeral presence ("aware") state.
//!
//! One entry per connection. The server overwrites `client_id` with the id
//! of the connection the state arrived on, so a client cannot speak for
//! another one. Aware state is broadcast but never persisted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feature::LngLat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub center: LngLat,
    pub zoom: f64,
    pub bearing: f64,
    pub pitch: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aware {
    pub client_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<Camera>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_features: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_server: bool,
}

impl Aware {
    pub fn for_client(client_id: Uuid) -> Self {
        Self {
            client_id,
            ..Self::default()
        }
    }

    /// Replace everything but the trusted client id.
    pub fn update_from(&mut self, incoming: Aware) {
        let client_id = self.client_id;
        *self = Aware { client_id, ..incoming };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_is_trusted() {
        let me = Uuid::new_v4();
        let mut aware = Aware::for_client(me);
        aware.update_from(Aware {
            client_id: Uuid::new_v4(),
            selected_features: vec!["f1".into()],
            ..Aware::default()
        });
        assert_eq!(aware.client_id, me);
        assert_eq!(aware.selected_features, vec!["f1".to_string()]);
    }

    #[test]
    fn test_json_shape() {
        let id = Uuid::nil();
        let aware = Aware {
            camera: Some(Camera {
                center: [8.5, 47.3],
                zoom: 12.0,
                bearing: 0.0,
                pitch: 30.0,
            }),
            ..Aware::for_client(id)
        };
        let json = serde_json::to_value(&aware).unwrap();
        assert_eq!(json["clientId"], id.to_string());
        assert_eq!(json["camera"]["center"], serde_json::json!([8.5, 47.3]));
        assert!(json.get("isServer").is_none());
        assert!(json.get("selectedFeatures").is_none());

        let minimal: Aware = serde_json::from_str(&format!(r#"{{"clientId":"{id}"}}"#)).unwrap();
        assert_eq!(minimal, Aware::for_client(id));
    }
}
