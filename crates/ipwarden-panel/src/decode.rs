//! Tolerant decoders for the panel's heterogeneous response shapes.
//!
//! The panel has shipped at least three layouts for `/api/nodes` (a bare
//! array, `{"nodes": [...]}`, `{"data": [...]}`) plus a single-node object,
//! and two layouts for `/api/users`. We discriminate on key presence rather
//! than failing on the first mismatch.

use serde_json::Value;

use ipwarden_core::Node;

/// Extract the node list from any known `/api/nodes` response shape.
/// Returns `None` when no shape matches.
pub fn nodes_from_response(value: &Value) -> Option<Vec<Node>> {
    let list = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("nodes") {
                items.as_slice()
            } else if let Some(Value::Array(items)) = map.get("data") {
                items.as_slice()
            } else if map.contains_key("id") && map.contains_key("name") {
                return node_from_value(value).map(|n| vec![n]);
            } else {
                return None;
            }
        }
        _ => return None,
    };
    let nodes: Vec<Node> = list.iter().filter_map(node_from_value).collect();
    Some(nodes)
}

fn node_from_value(value: &Value) -> Option<Node> {
    Some(Node {
        id: value.get("id")?.as_i64()?,
        name: value.get("name")?.as_str()?.to_string(),
        address: value
            .get("address")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// One page of `/api/users`: the usernames plus the advertised total.
pub fn users_page_from_response(value: &Value) -> Option<(Vec<String>, usize)> {
    let (list, total) = match value {
        Value::Array(items) => (items.as_slice(), items.len()),
        Value::Object(map) => {
            let Some(Value::Array(items)) = map.get("users") else {
                return None;
            };
            let total = map
                .get("total")
                .and_then(Value::as_u64)
                .map(|t| t as usize)
                .unwrap_or(items.len());
            (items.as_slice(), total)
        }
        _ => return None,
    };
    let usernames = list
        .iter()
        .filter_map(|u| u.get("username").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    Some((usernames, total))
}

/// `/api/groups` tolerates `{"groups": [...]}` and a bare array.
pub fn groups_from_response(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => match map.get("groups") {
            Some(Value::Array(items)) => Some(items.clone()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nodes_decode_from_bare_array() {
        let value = json!([
            {"id": 1, "name": "edge-1", "address": "10.0.0.1", "status": "connected"},
            {"id": 2, "name": "edge-2", "address": "10.0.0.2", "status": "disconnected", "message": "tls"}
        ]);
        let nodes = nodes_from_response(&value).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].is_connected());
        assert_eq!(nodes[1].message.as_deref(), Some("tls"));
    }

    #[test]
    fn nodes_decode_from_wrapped_shapes() {
        for key in ["nodes", "data"] {
            let value = json!({ key: [{"id": 3, "name": "edge-3", "address": "", "status": "connected"}] });
            let nodes = nodes_from_response(&value).unwrap();
            assert_eq!(nodes[0].id, 3);
        }
    }

    #[test]
    fn single_node_dict_is_accepted() {
        let value = json!({"id": 9, "name": "solo", "address": "10.0.0.9", "status": "connected"});
        let nodes = nodes_from_response(&value).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "solo");
    }

    #[test]
    fn unknown_shape_yields_none() {
        assert!(nodes_from_response(&json!({"unexpected": true})).is_none());
        assert!(nodes_from_response(&json!("nope")).is_none());
    }

    #[test]
    fn users_page_decodes_wrapped_and_bare() {
        let wrapped = json!({"users": [{"username": "a"}, {"username": "b"}], "total": 250});
        let (users, total) = users_page_from_response(&wrapped).unwrap();
        assert_eq!(users, vec!["a", "b"]);
        assert_eq!(total, 250);

        let bare = json!([{"username": "c"}]);
        let (users, total) = users_page_from_response(&bare).unwrap();
        assert_eq!(users, vec!["c"]);
        assert_eq!(total, 1);
    }

    #[test]
    fn groups_decode_both_shapes() {
        let wrapped = json!({"groups": [{"id": 1}]});
        assert_eq!(groups_from_response(&wrapped).unwrap().len(), 1);
        let bare = json!([{"id": 1}, {"id": 2}]);
        assert_eq!(groups_from_response(&bare).unwrap().len(), 2);
    }
}
