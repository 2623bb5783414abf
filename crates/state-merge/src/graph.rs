//! Graph node upsert and group merge.

use chrono::{DateTime, Utc};
use scenario_state::{GraphGroup, GraphNode};
use sha2::{Digest, Sha256};

/// SHA-256 over the node's canonical JSON, excluding `updated_at`.
///
/// `serde_json` maps are key-sorted, so the encoding is stable.
pub fn content_signature(node: &GraphNode) -> String {
    let mut value = match serde_json::to_value(node) {
        Ok(value) => value,
        Err(_) => return String::new(),
    };
    if let Some(map) = value.as_object_mut() {
        map.remove("updated_at");
    }
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

/// Counts from one upsert pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub changed: usize,
    pub unchanged: usize,
}

/// Upsert nodes by id and leave the list sorted by id.
///
/// An unchanged signature keeps the stored `updated_at`; new or changed
/// nodes are stamped with `now`.
pub fn upsert_nodes(
    existing: &mut Vec<GraphNode>,
    incoming: Vec<GraphNode>,
    now: DateTime<Utc>,
) -> UpsertStats {
    let mut stats = UpsertStats::default();
    for mut node in incoming {
        match existing.iter_mut().find(|n| n.id == node.id) {
            Some(current) if content_signature(current) == content_signature(&node) => {
                stats.unchanged += 1;
            }
            Some(current) => {
                node.updated_at = Some(now);
                *current = node;
                stats.changed += 1;
            }
            None => {
                node.updated_at = Some(now);
                existing.push(node);
                stats.inserted += 1;
            }
        }
    }
    existing.sort_by(|a, b| a.id.cmp(&b.id));
    stats
}

/// Merge groups by id; member lists are unioned without duplicates.
pub fn merge_groups(existing: &mut Vec<GraphGroup>, incoming: Vec<GraphGroup>) {
    for group in incoming {
        match existing.iter_mut().find(|g| g.id == group.id) {
            Some(current) => {
                if !group.title.is_empty() {
                    current.title = group.title;
                }
                if group.pillar.is_some() {
                    current.pillar = group.pillar;
                }
                for id in group.node_ids {
                    if !current.node_ids.contains(&id) {
                        current.node_ids.push(id);
                    }
                }
            }
            None => {
                let mut group = group;
                let mut seen = Vec::with_capacity(group.node_ids.len());
                group.node_ids.retain(|id| {
                    if seen.contains(id) {
                        false
                    } else {
                        seen.push(id.clone());
                        true
                    }
                });
                existing.push(group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scenario_state::NodeStatus;
    use serde_json::json;

    fn node(id: &str, title: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            title: title.to_string(),
            pillar: "market".to_string(),
            node_type: "insight".to_string(),
            content: json!({"text": title}),
            confidence: 0.7,
            dependencies: Vec::new(),
            status: NodeStatus::Draft,
            updated_at: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_signature_ignores_updated_at() {
        let a = node("n1", "A");
        let mut b = a.clone();
        b.updated_at = Some(at(5));
        assert_eq!(content_signature(&a), content_signature(&b));
        b.title = "B".to_string();
        assert_ne!(content_signature(&a), content_signature(&b));
    }

    #[test]
    fn test_unchanged_node_keeps_timestamp() {
        let mut nodes = Vec::new();
        upsert_nodes(&mut nodes, vec![node("n1", "A")], at(1));
        let stats = upsert_nodes(&mut nodes, vec![node("n1", "A")], at(2));
        assert_eq!(stats.unchanged, 1);
        assert_eq!(nodes[0].updated_at, Some(at(1)));

        let stats = upsert_nodes(&mut nodes, vec![node("n1", "A2")], at(3));
        assert_eq!(stats.changed, 1);
        assert_eq!(nodes[0].updated_at, Some(at(3)));
    }

    #[test]
    fn test_nodes_sorted_by_id() {
        let mut nodes = Vec::new();
        upsert_nodes(
            &mut nodes,
            vec![node("c", "C"), node("a", "A"), node("b", "B")],
            at(1),
        );
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_groups_dedupes_members() {
        let mut groups = vec![GraphGroup {
            id: "g".to_string(),
            title: "G".to_string(),
            pillar: None,
            node_ids: vec!["a".to_string()],
        }];
        merge_groups(
            &mut groups,
            vec![GraphGroup {
                id: "g".to_string(),
                title: String::new(),
                pillar: Some("market".to_string()),
                node_ids: vec!["a".to_string(), "b".to_string()],
            }],
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].node_ids, vec!["a", "b"]);
        assert_eq!(groups[0].title, "G");
        assert_eq!(groups[0].pillar.as_deref(), Some("market"));
    }
}
