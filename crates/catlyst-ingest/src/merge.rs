//! Merge an incident with its sub-resources and shape the result.
//!
//! Everything here is pure: the same inputs always give the same record.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::config::FilterConfig;
use crate::fetch::select_recent_notes;
use crate::model::{DeepVisibilityEvent, Incident, Indicator, Note};

/// Key under which deep-visibility events are attached.
pub const DEEP_VISIBILITY_KEY: &str = "deepVisibilityEvents";
/// Key under which retained note texts are attached.
pub const NOTES_KEY: &str = "notes";
/// Key under which indicators are attached.
pub const INDICATORS_KEY: &str = "indicators";

/// Build the nested record for one incident.
#[must_use]
pub fn merge_incident(
    incident: &Incident,
    events: &[DeepVisibilityEvent],
    notes: &[Note],
    indicators: &[Indicator],
    notes_max_len: usize,
) -> Value {
    let mut record = incident.raw.clone();
    record.insert(
        DEEP_VISIBILITY_KEY.into(),
        Value::Array(events.iter().map(|e| Value::Object(e.fields.clone())).collect()),
    );
    record.insert(
        NOTES_KEY.into(),
        Value::Array(
            select_recent_notes(notes, notes_max_len)
                .into_iter()
                .map(Value::String)
                .collect(),
        ),
    );
    record.insert(
        INDICATORS_KEY.into(),
        Value::Array(indicators.iter().map(|i| Value::Object(i.fields.clone())).collect()),
    );
    Value::Object(record)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathNode {
    /// Keep the whole value.
    Leaf,
    Branch(BTreeMap<String, PathNode>),
}

/// Allow-list of dot-separated field paths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhitelistFilter {
    root: BTreeMap<String, PathNode>,
}

impl WhitelistFilter {
    #[must_use]
    pub fn new<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut root = BTreeMap::new();
        for path in paths {
            let segments: Vec<&str> = path.as_ref().split('.').filter(|s| !s.is_empty()).collect();
            insert_path(&mut root, &segments);
        }
        Self { root }
    }

    /// An empty whitelist keeps everything.
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.root.is_empty()
    }

    /// Project `value` onto the allowed paths.
    ///
    /// Missing and null values are omitted, as are branches left empty.
    #[must_use]
    pub fn project(&self, value: &Value) -> Value {
        if self.is_pass_through() {
            return value.clone();
        }
        Value::Object(project_node(value, &self.root).unwrap_or_default())
    }
}

fn insert_path(node: &mut BTreeMap<String, PathNode>, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        node.insert((*first).to_string(), PathNode::Leaf);
        return;
    }
    let child = node
        .entry((*first).to_string())
        .or_insert_with(|| PathNode::Branch(BTreeMap::new()));
    if let PathNode::Branch(children) = child {
        insert_path(children, rest);
    }
}

fn project_node(value: &Value, children: &BTreeMap<String, PathNode>) -> Option<Map<String, Value>> {
    let object = value.as_object()?;
    let mut out = Map::new();
    for (key, node) in children {
        let Some(found) = object.get(key).filter(|v| !v.is_null()) else {
            continue;
        };
        match node {
            PathNode::Leaf => {
                out.insert(key.clone(), found.clone());
            }
            PathNode::Branch(grandchildren) => {
                if let Some(inner) = project_node(found, grandchildren) {
                    out.insert(key.clone(), Value::Object(inner));
                }
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

/// Remove dot-separated paths from `value` in place. A `*` segment matches
/// every element of an array.
pub fn drop_paths<S: AsRef<str>>(value: &mut Value, paths: &[S]) {
    for path in paths {
        let segments: Vec<&str> = path.as_ref().split('.').collect();
        drop_segments(value, &segments);
    }
}

fn drop_segments(current: &mut Value, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    match current {
        Value::Array(items) if *first == "*" => {
            for item in items {
                drop_segments(item, rest);
            }
        }
        Value::Object(map) => {
            if rest.is_empty() {
                map.remove(*first);
            } else if let Some(child) = map.get_mut(*first) {
                drop_segments(child, rest);
            }
        }
        _ => {}
    }
}

/// Flatten nested objects into `parent_child` keys.
///
/// Arrays of scalars are joined with `|`; arrays holding objects or arrays
/// are joined as compact JSON.
#[must_use]
pub fn flatten_record(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Value::Object(map) = value {
        flatten_into(map, "", &mut out);
    }
    out
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, out: &mut Map<String, Value>) {
    for (key, value) in map {
        let name = format!("{prefix}{key}");
        match value {
            Value::Object(inner) => flatten_into(inner, &format!("{name}_"), out),
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("|");
                out.insert(name, Value::String(joined));
            }
            scalar => {
                out.insert(name, scalar.clone());
            }
        }
    }
}

/// Drop ignored fields, merge sub-resources, apply the whitelist.
#[derive(Debug, Clone)]
pub struct RecordShaper {
    ignore_fields: Vec<String>,
    whitelist: WhitelistFilter,
    notes_max_len: usize,
}

impl RecordShaper {
    #[must_use]
    pub fn new(filter: &FilterConfig) -> Self {
        Self {
            ignore_fields: filter.ignore_fields.clone(),
            whitelist: WhitelistFilter::new(&filter.whitelist),
            notes_max_len: filter.notes_max_len,
        }
    }

    #[must_use]
    pub fn shape(
        &self,
        incident: &Incident,
        events: &[DeepVisibilityEvent],
        notes: &[Note],
        indicators: &[Indicator],
    ) -> Value {
        let mut cleaned = incident.clone();
        if !self.ignore_fields.is_empty() {
            let mut raw = Value::Object(cleaned.raw);
            drop_paths(&mut raw, &self.ignore_fields);
            cleaned.raw = match raw {
                Value::Object(map) => map,
                _ => Map::new(),
            };
        }
        let merged = merge_incident(&cleaned, events, notes, indicators, self.notes_max_len);
        self.whitelist.project(&merged)
    }
}
