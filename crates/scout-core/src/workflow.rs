//! Workflow document types.
//!
//! Only the fields the scanner cares about are modeled; everything else is
//! carried through untouched so a corrected workflow can be re-serialized
//! without losing host-specific data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A node-graph workflow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub extra: WorkflowExtra,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// One unit of the workflow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type", default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub widgets_values: Vec<Value>,
    #[serde(default)]
    pub properties: NodeProperties,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl Node {
    /// Note nodes carry free text in their first widget value.
    pub fn is_note(&self) -> bool {
        matches!(
            self.node_type.as_deref(),
            Some("Note") | Some("MarkdownNote")
        )
    }

    pub fn note_text(&self) -> Option<&str> {
        if !self.is_note() {
            return None;
        }
        self.widgets_values.first().and_then(|v| v.as_str())
    }
}

/// Node properties; `models` is the structured asset descriptor list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<ModelDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// A structured asset descriptor declared by a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl ModelDescriptor {
    /// Category, preferring `directory` over the legacy `folder` alias.
    pub fn category(&self) -> &str {
        self.directory
            .as_deref()
            .or(self.folder.as_deref())
            .unwrap_or("checkpoints")
    }
}

/// Workflow-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowExtra {
    /// Top-level map from asset name to its declared URL and category.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_urls: BTreeMap<String, ModelUrlEntry>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUrlEntry {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl ModelUrlEntry {
    pub fn category(&self) -> &str {
        self.directory
            .as_deref()
            .or(self.folder.as_deref())
            .unwrap_or("checkpoints")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserializes_minimal_workflow() {
        let json = r#"{
            "nodes": [
                {"id": 1, "type": "CheckpointLoaderSimple",
                 "widgets_values": ["model.safetensors"]}
            ]
        }"#;
        let wf: Workflow = serde_json::from_str(json).unwrap();
        assert_eq!(wf.nodes.len(), 1);
        assert_eq!(wf.nodes[0].id, Some(1));
        assert_eq!(
            wf.nodes[0].widgets_values[0].as_str(),
            Some("model.safetensors")
        );
    }

    #[test]
    fn test_preserves_unknown_fields_on_round_trip() {
        let json = r#"{
            "nodes": [{"id": 2, "type": "Note", "widgets_values": ["hello"],
                       "pos": [100, 200]}],
            "links": [[1, 2, 3]],
            "extra": {"model_urls": {}, "ds": {"scale": 1.0}}
        }"#;
        let wf: Workflow = serde_json::from_str(json).unwrap();
        let back = serde_json::to_value(&wf).unwrap();
        assert_eq!(back["links"][0][2], 3);
        assert_eq!(back["nodes"][0]["pos"][1], 200);
        assert_eq!(back["extra"]["ds"]["scale"], 1.0);
    }

    #[test]
    fn test_note_text() {
        let json = r#"{"type": "MarkdownNote", "widgets_values": ["see link"]}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert!(node.is_note());
        assert_eq!(node.note_text(), Some("see link"));

        let json = r#"{"type": "KSampler", "widgets_values": ["not a note"]}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.note_text(), None);
    }

    #[test]
    fn test_descriptor_category_fallbacks() {
        let d = ModelDescriptor {
            folder: Some("loras".into()),
            ..Default::default()
        };
        assert_eq!(d.category(), "loras");

        let d = ModelDescriptor::default();
        assert_eq!(d.category(), "checkpoints");

        let d = ModelDescriptor {
            directory: Some("vae".into()),
            folder: Some("loras".into()),
            ..Default::default()
        };
        assert_eq!(d.category(), "vae");
    }
}
