//! Maps raw provider payloads onto [`MarketPayload`].
//!
//! Every historically-observed result placement is handled here and only
//! here. A new provider shape means one change in this module.

use crate::{FeedError, MarketPayload};
use oddsbook_common::ResultEntry;
use serde_json::{Map, Value};

/// Keys tried, in order, when pulling a winner out of a result element.
const WINNER_KEYS: &[&str] = &["winner", "result", "res", "win"];

/// Result container keys recognized on object payloads.
const RESULT_CONTAINER_KEYS: &[&str] = &["results", "result"];

/// Normalizes a raw provider response.
///
/// Accepted shapes:
/// - a bare array of result elements (no current state),
/// - an object with results under `results`, `results.res`, `result.res`
///   (plus anything else, which becomes the current state),
/// - an object with no result container at all (pure current state).
///
/// Anything else is malformed and fails the whole poll.
pub fn normalize_payload(value: Value) -> Result<MarketPayload, FeedError> {
    match value {
        Value::Array(items) => Ok(MarketPayload {
            current_state: None,
            results: collect_entries(items),
        }),
        Value::Object(map) => {
            let results = extract_results(&map)?;
            // The payload counts as current state only when it carries
            // something beyond the result container.
            let current_state = if has_state_fields(&map) {
                Some(Value::Object(map))
            } else {
                None
            };
            Ok(MarketPayload {
                current_state,
                results,
            })
        }
        other => Err(FeedError::Malformed(format!(
            "expected object or array, got {}",
            json_kind(&other)
        ))),
    }
}

/// Pulls the result list out of an object payload, whichever of the known
/// containers it lives in. A missing container means zero results.
fn extract_results(map: &Map<String, Value>) -> Result<Vec<ResultEntry>, FeedError> {
    let Some((key, container)) = RESULT_CONTAINER_KEYS
        .iter()
        .find_map(|key| map.get(*key).map(|value| (*key, value)))
    else {
        return Ok(Vec::new());
    };

    let items = match container {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        Value::Object(inner) => match inner.get("res") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return Ok(Vec::new()),
            Some(other) => {
                return Err(FeedError::Malformed(format!(
                    "{}.res is {}, expected an array",
                    key,
                    json_kind(other)
                )));
            }
        },
        other => {
            return Err(FeedError::Malformed(format!(
                "{} is {}, expected an array or object",
                key,
                json_kind(other)
            )));
        }
    };

    Ok(collect_entries(items.clone()))
}

fn collect_entries(items: Vec<Value>) -> Vec<ResultEntry> {
    items
        .into_iter()
        .filter_map(|element| {
            let entry = entry_from_element(element);
            if entry.is_none() {
                tracing::warn!("Skipping result element with no recognizable winner");
            }
            entry
        })
        .collect()
}

/// Builds a [`ResultEntry`] from one list element. Scalars are taken as the
/// winner directly; objects are searched for a winner key. Elements with no
/// recognizable winner are dropped.
fn entry_from_element(element: Value) -> Option<ResultEntry> {
    let winner = match &element {
        Value::Object(map) => WINNER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(scalar_to_string)),
        scalar => scalar_to_string(scalar),
    }?;
    Some(ResultEntry::new(winner, element))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn has_state_fields(map: &Map<String, Value>) -> bool {
    map.keys().any(|key| !RESULT_CONTAINER_KEYS.contains(&key.as_str()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_res_shape() {
        let payload = normalize_payload(json!({
            "result": {"res": [{"winner": "A"}, {"winner": "B"}]}
        }))
        .unwrap();
        assert!(payload.current_state.is_none());
        assert_eq!(payload.results.len(), 2);
        assert_eq!(payload.results[0].winner, "A");
        assert_eq!(payload.results[1].winner, "B");
    }

    #[test]
    fn test_bare_array_shape() {
        let payload = normalize_payload(json!([{"win": 3}, "B"])).unwrap();
        assert!(payload.current_state.is_none());
        assert_eq!(payload.results.len(), 2);
        assert_eq!(payload.results[0].winner, "3");
        assert_eq!(payload.results[1].winner, "B");
    }

    #[test]
    fn test_results_array_shape() {
        let payload = normalize_payload(json!({
            "t1": {"round": 88, "cards": ["KH", "2S"]},
            "results": [{"result": "7"}]
        }))
        .unwrap();
        let state = payload.current_state.expect("state fields present");
        assert_eq!(state["t1"]["round"], 88);
        assert_eq!(payload.results.len(), 1);
        assert_eq!(payload.results[0].winner, "7");
    }

    #[test]
    fn test_results_res_shape() {
        let payload = normalize_payload(json!({
            "results": {"res": [{"res": "11"}]}
        }))
        .unwrap();
        assert!(payload.current_state.is_none());
        assert_eq!(payload.results.len(), 1);
        assert_eq!(payload.results[0].winner, "11");
    }

    #[test]
    fn test_state_only_payload() {
        let payload = normalize_payload(json!({"t1": {"status": "open"}})).unwrap();
        assert!(payload.current_state.is_some());
        assert!(payload.results.is_empty());
    }

    #[test]
    fn test_raw_element_is_preserved() {
        let payload = normalize_payload(json!({
            "results": [{"winner": "A", "round": 19}]
        }))
        .unwrap();
        assert_eq!(payload.results[0].raw["round"], 19);
    }

    #[test]
    fn test_winnerless_element_is_skipped() {
        let payload = normalize_payload(json!({
            "results": [{"mid": 5}, {"winner": "A"}]
        }))
        .unwrap();
        assert_eq!(payload.results.len(), 1);
        assert_eq!(payload.results[0].winner, "A");
    }

    #[test]
    fn test_scalar_payload_is_malformed() {
        assert!(matches!(
            normalize_payload(json!(42)),
            Err(FeedError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_res_container_is_malformed() {
        assert!(matches!(
            normalize_payload(json!({"results": {"res": {"winner": "A"}}})),
            Err(FeedError::Malformed(_))
        ));
        assert!(matches!(
            normalize_payload(json!({"result": "A"})),
            Err(FeedError::Malformed(_))
        ));
    }

    #[test]
    fn test_null_containers_mean_no_results() {
        let payload = normalize_payload(json!({"results": null, "t1": {}})).unwrap();
        assert!(payload.results.is_empty());
        assert!(payload.current_state.is_some());

        let payload = normalize_payload(json!({"result": {"res": null}})).unwrap();
        assert!(payload.results.is_empty());
        assert!(payload.current_state.is_none());
    }
}
