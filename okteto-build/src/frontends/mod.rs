use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

use crate::services::ManifestFrontend;

mod docker_compose;
mod okteto_manifest;

pub use docker_compose::DockerComposeFrontend;
pub use okteto_manifest::OktetoManifestFrontend;

/// Picks the frontend by file name.
pub fn frontend_for(manifest_path: &Path) -> Box<dyn ManifestFrontend> {
    let file_name = manifest_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();

    if file_name.starts_with("docker-compose") || file_name.starts_with("compose") {
        Box::new(DockerComposeFrontend::new())
    } else {
        Box::new(OktetoManifestFrontend::new())
    }
}

/// `KEY: value` maps and `KEY=value` lists are both accepted wherever
/// variables are declared.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MapList {
    Map(IndexMap<String, Value>),
    List(Vec<String>),
}

impl Default for MapList {
    fn default() -> Self {
        MapList::List(Vec::new())
    }
}

impl MapList {
    /// Pairs in declaration order.
    pub fn into_pairs(self) -> Vec<(String, String)> {
        match self {
            MapList::Map(map) => map
                .into_iter()
                .map(|(key, value)| (key, scalar_to_string(value)))
                .collect(),
            MapList::List(list) => list.into_iter().map(MapList::split_value).collect(),
        }
    }

    fn split_value(value: String) -> (String, String) {
        match value.find('=') {
            Some(split_index) => {
                let (key, value) = value.split_at(split_index);
                (key.into(), value[1..].into())
            }
            None => (value, "".into()),
        }
    }
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::String(value) => value,
        Value::Number(value) => value.to_string(),
        Value::Bool(value) => value.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .map(|value| value.trim_start_matches("---").trim().to_string())
            .unwrap_or_default(),
    }
}

/// A single string or a list of them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringOrList {
    fn default() -> Self {
        StringOrList::Many(Vec::new())
    }
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => vec![value],
            StringOrList::Many(values) => values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ManifestKind;

    #[test]
    fn splits_list_values() {
        let list = MapList::List(vec!["A=1".into(), "B=x=y".into(), "C".into()]);
        assert_eq!(
            list.into_pairs(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("C".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn map_values_keep_order_and_become_strings() {
        let map: MapList = serde_yaml::from_str("ZED: 1\nALPHA: true\nMID: text\n").unwrap();
        assert_eq!(
            map.into_pairs(),
            vec![
                ("ZED".to_string(), "1".to_string()),
                ("ALPHA".to_string(), "true".to_string()),
                ("MID".to_string(), "text".to_string()),
            ]
        );
    }

    #[test]
    fn picks_frontend_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let content = "services:\n  api:\n    build: api\n";

        let compose_path = dir.path().join("docker-compose.yml");
        std::fs::write(&compose_path, content).unwrap();
        let compose = frontend_for(&compose_path).manifest("test", &compose_path).unwrap();
        assert_eq!(compose.kind, ManifestKind::Stack);

        let okteto_path = dir.path().join("okteto.yml");
        std::fs::write(&okteto_path, "build:\n  api: api\n").unwrap();
        let okteto = frontend_for(&okteto_path).manifest("test", &okteto_path).unwrap();
        assert_eq!(okteto.kind, ManifestKind::Pipeline);
    }
}
