//! Canonical canvas JSON (§6): the one serialization every canvas document
//! goes through before being written to disk. Must be deterministic across
//! semantically-equal docs, since the sha256 of its output is what the
//! reconciliation's NOOP/UPDATE decision compares against.

use serde_json::{Map, Value};

use crate::cds_client::CanvasDoc;

fn id_of(map: &Map<String, Value>) -> String {
    map.get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Serialize a canvas doc to its canonical form: `{"edges": [...],
/// "nodes": [...]}`, each array sorted by `id`, 2-space indent, keys
/// sorted at every level (free from `serde_json::Map`, which is
/// `BTreeMap`-backed without the `preserve_order` feature). Any node whose
/// `id` matches a top-level text key has its `text` field overwritten by
/// that text before sorting.
pub fn serialize_canvas(doc: &CanvasDoc) -> String {
    let mut edges = doc.edges.clone();
    let mut nodes = doc.nodes.clone();

    for node in nodes.iter_mut() {
        let id = id_of(node);
        if let Some(text) = doc.texts.get(&id) {
            node.insert("text".to_string(), Value::String(text.clone()));
        }
    }

    edges.sort_by(|a, b| id_of(a).cmp(&id_of(b)));
    nodes.sort_by(|a, b| id_of(a).cmp(&id_of(b)));

    let mut top = Map::new();
    top.insert(
        "edges".to_string(),
        Value::Array(edges.into_iter().map(Value::Object).collect()),
    );
    top.insert(
        "nodes".to_string(),
        Value::Array(nodes.into_iter().map(Value::Object).collect()),
    );

    serde_json::to_string_pretty(&Value::Object(top)).expect("canvas doc serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(id: &str, extra: &[(&str, &str)]) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("id".to_string(), Value::String(id.to_string()));
        for (k, v) in extra {
            m.insert(k.to_string(), Value::String(v.to_string()));
        }
        m
    }

    #[test]
    fn sorts_nodes_and_edges_by_id() {
        let doc = CanvasDoc {
            edges: vec![node("e2", &[]), node("e1", &[])],
            nodes: vec![node("n2", &[]), node("n1", &[])],
            texts: BTreeMap::new(),
        };
        let json: Value = serde_json::from_str(&serialize_canvas(&doc)).unwrap();
        let node_ids: Vec<_> = json["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["id"].as_str().unwrap())
            .collect();
        assert_eq!(node_ids, vec!["n1", "n2"]);
    }

    #[test]
    fn overwrites_node_text_from_top_level_key() {
        let mut texts = BTreeMap::new();
        texts.insert("n1".to_string(), "live crdt text".to_string());
        let doc = CanvasDoc {
            edges: vec![],
            nodes: vec![node("n1", &[("text", "stale")])],
            texts,
        };
        let json: Value = serde_json::from_str(&serialize_canvas(&doc)).unwrap();
        assert_eq!(json["nodes"][0]["text"], "live crdt text");
    }

    #[test]
    fn deterministic_across_equivalent_field_order() {
        let doc_a = CanvasDoc {
            edges: vec![],
            nodes: vec![node("n1", &[("kind", "text")])],
            texts: BTreeMap::new(),
        };
        let mut node_b = Map::new();
        node_b.insert("kind".to_string(), Value::String("text".to_string()));
        node_b.insert("id".to_string(), Value::String("n1".to_string()));
        let doc_b = CanvasDoc {
            edges: vec![],
            nodes: vec![node_b],
            texts: BTreeMap::new(),
        };
        assert_eq!(serialize_canvas(&doc_a), serialize_canvas(&doc_b));
    }
}
