//! Patch path classification and RFC 6901 tree writes.
//!
//! Paths with merge semantics of their own (evidence sources, graph nodes,
//! graph groups, decision selections) resolve to dedicated `PatchTarget`
//! variants; everything else is a plain structural pointer.

use std::str::FromStr;

use scenario_state::DecisionKey;
use serde_json::{Map, Value};

use crate::error::{PointerError, PointerResult};

/// Where a patch lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    /// `/decisions/<k>/selected_option_id` or `/decisions/<k>/selection_source`
    DecisionSelection { decision: DecisionKey },
    /// `/evidence/sources`, merged by normalized URL
    EvidenceSources,
    /// `/graph/nodes`, upserted by id
    GraphNodes,
    /// `/graph/groups`, merged by id
    GraphGroups,
    /// Any other path, as unescaped reference tokens
    Pointer(Vec<String>),
}

impl PatchTarget {
    pub fn parse(path: &str) -> PointerResult<Self> {
        let tokens = tokens(path)?;
        let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let target = match refs.as_slice() {
            ["decisions", key, "selected_option_id" | "selection_source"] => {
                match DecisionKey::from_str(key) {
                    Ok(decision) => Self::DecisionSelection { decision },
                    Err(_) => Self::Pointer(tokens.clone()),
                }
            }
            ["evidence", "sources"] | ["evidence", "sources", "-"] => Self::EvidenceSources,
            ["graph", "nodes"] | ["graph", "nodes", "-"] => Self::GraphNodes,
            ["graph", "groups"] | ["graph", "groups", "-"] => Self::GraphGroups,
            _ => Self::Pointer(tokens.clone()),
        };
        Ok(target)
    }
}

/// Merge order of a path: lower first.
pub fn priority(path: &str) -> u8 {
    let section = path.trim_start_matches('/').split('/').next().unwrap_or("");
    match section {
        "evidence" => 0,
        "decisions" => 1,
        "pillars" => 2,
        "graph" => 3,
        "execution" => 4,
        "telemetry" => 5,
        "artifacts" => 6,
        _ => 7,
    }
}

/// Split a pointer into unescaped tokens. The root pointer is not writable.
pub fn tokens(path: &str) -> PointerResult<Vec<String>> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PointerError::Invalid(path.to_string()))?;
    if rest.is_empty() {
        return Err(PointerError::Invalid(path.to_string()));
    }
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn render(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| format!("/{}", t.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn array_index(tokens: &[String], token: &str, len: usize, allow_end: bool) -> PointerResult<usize> {
    let bad = || PointerError::BadIndex {
        path: render(tokens),
        index: token.to_string(),
    };
    let index = if token == "-" {
        len
    } else {
        token.parse::<usize>().map_err(|_| bad())?
    };
    if index < len || (allow_end && index == len) {
        Ok(index)
    } else {
        Err(bad())
    }
}

fn empty_container_for(next: &str) -> Value {
    if next == "-" || next.parse::<usize>().is_ok() {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

/// Walk to the parent of the last token, creating missing containers.
fn parent_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> PointerResult<&'a mut Value> {
    let mut current = doc;
    for (depth, token) in tokens[..tokens.len() - 1].iter().enumerate() {
        let next = &tokens[depth + 1];
        current = match current {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| empty_container_for(next)),
            Value::Array(items) => {
                let len = items.len();
                let index = array_index(&tokens[..=depth], token, len, true)?;
                if index == len {
                    items.push(empty_container_for(next));
                }
                &mut items[index]
            }
            _ => return Err(PointerError::NotAContainer(render(&tokens[..depth]))),
        };
        if current.is_null() {
            *current = empty_container_for(next);
        }
    }
    Ok(current)
}

/// `add`: insert into arrays (`-` appends), set on objects.
pub fn add(doc: &mut Value, tokens: &[String], value: Value) -> PointerResult<()> {
    write(doc, tokens, value, true)
}

/// `replace`: overwrite in place, creating missing intermediates.
pub fn replace(doc: &mut Value, tokens: &[String], value: Value) -> PointerResult<()> {
    write(doc, tokens, value, false)
}

fn write(doc: &mut Value, tokens: &[String], value: Value, insert: bool) -> PointerResult<()> {
    let Some(last) = tokens.last() else {
        return Err(PointerError::Invalid(String::new()));
    };
    match parent_mut(doc, tokens)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let index = array_index(tokens, last, len, insert || last == "-")?;
            if index == len {
                items.push(value);
            } else if insert {
                items.insert(index, value);
            } else {
                items[index] = value;
            }
            Ok(())
        }
        _ => Err(PointerError::NotAContainer(render(&tokens[..tokens.len() - 1]))),
    }
}

/// `remove`: delete an existing value. Never creates anything.
pub fn remove(doc: &mut Value, tokens: &[String]) -> PointerResult<Value> {
    let missing = || PointerError::MissingTarget(render(tokens));
    let (last, parents) = tokens.split_last().ok_or_else(missing)?;
    let mut current = doc;
    for token in parents {
        current = match current {
            Value::Object(map) => map.get_mut(token).ok_or_else(missing)?,
            Value::Array(items) => {
                let index = token.parse::<usize>().map_err(|_| missing())?;
                items.get_mut(index).ok_or_else(missing)?
            }
            _ => return Err(missing()),
        };
    }
    match current {
        Value::Object(map) => map.remove(last).ok_or_else(missing),
        Value::Array(items) => {
            let index = last.parse::<usize>().map_err(|_| missing())?;
            if index < items.len() {
                Ok(items.remove(index))
            } else {
                Err(missing())
            }
        }
        _ => Err(missing()),
    }
}
