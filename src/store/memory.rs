//! In-process graph store
//!
//! Understands the subset of the protocol the uploader speaks: single
//! `eq(predicate, $var)` lookups returning uids, blank-label and uid sets
//! with nested `likes` / `~likes` edges, and uid deletes. Like the real
//! store, every blank node creates a new node, so concurrent creations of
//! one key produce duplicates.

use crate::store::{Assigned, GraphStore, Mutation, StoreError, Vars};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default, Clone)]
struct Node {
    predicates: Map<String, Value>,
    likes: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Graph {
    next_uid: u64,
    nodes: BTreeMap<String, Node>,
    schema: String,
}

impl Graph {
    fn allocate(&mut self) -> String {
        self.next_uid += 1;
        let uid = format!("0x{:x}", self.next_uid);
        self.nodes.insert(uid.clone(), Node::default());
        uid
    }

    /// Applies one node object and returns its uid
    fn set_node(
        &mut self,
        object: &Map<String, Value>,
        labels: &mut HashMap<String, String>,
    ) -> Result<String, StoreError> {
        let uid = match object.get("uid").and_then(Value::as_str) {
            Some(uid) => match uid.strip_prefix("_:") {
                Some(label) => match labels.get(label) {
                    Some(uid) => uid.clone(),
                    None => {
                        let uid = self.allocate();
                        labels.insert(label.to_string(), uid.clone());
                        uid
                    }
                },
                None => {
                    self.nodes.entry(uid.to_string()).or_default();
                    uid.to_string()
                }
            },
            None => self.allocate(),
        };

        for (predicate, value) in object {
            match predicate.as_str() {
                "uid" => {}
                "likes" | "~likes" => {
                    for child in nodes_of(value)? {
                        let child_uid = self.set_node(child, labels)?;
                        let (from, to) = if predicate == "likes" {
                            (&uid, &child_uid)
                        } else {
                            (&child_uid, &uid)
                        };
                        if let Some(node) = self.nodes.get_mut(from) {
                            node.likes.insert(to.clone());
                        }
                    }
                }
                // facets live on edges and are not modelled
                p if p.contains('|') => {}
                _ => {
                    if let Some(node) = self.nodes.get_mut(&uid) {
                        node.predicates.insert(predicate.clone(), value.clone());
                    }
                }
            }
        }
        Ok(uid)
    }

    fn delete_node(&mut self, uid: &str) {
        self.nodes.remove(uid);
        for node in self.nodes.values_mut() {
            node.likes.remove(uid);
        }
    }

    fn find(&self, predicate: &str, value: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| {
                node.predicates.get(predicate).and_then(Value::as_str) == Some(value)
            })
            .map(|(uid, _)| uid.clone())
            .collect()
    }
}

fn nodes_of(value: &Value) -> Result<Vec<&Map<String, Value>>, StoreError> {
    match value {
        Value::Object(object) => Ok(vec![object]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    StoreError::Remote(format!("expected node object, got {}", item))
                })
            })
            .collect(),
        other => Err(StoreError::Remote(format!("expected node object, got {}", other))),
    }
}

/// `(result set, predicate, variable)` of a single-function lookup query
fn parse_lookup(query: &str) -> Option<(&str, &str, &str)> {
    let func = query.find("(func:")?;
    let name = query[..func]
        .trim_end()
        .rsplit(|c: char| c.is_whitespace() || c == '{')
        .next()?;

    let rest = &query[func..];
    let eq = rest.find("eq(")? + 3;
    let args = &rest[eq..];
    let close = args.find(')')?;
    let (predicate, var) = args[..close].split_once(',')?;
    Some((name, predicate.trim(), var.trim()))
}

/// Graph store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    graph: Mutex<Graph>,
    queries: AtomicUsize,
    mutations: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a node with a single predicate, bypassing the protocol
    pub fn insert_node(&self, predicate: &str, value: &str) -> String {
        let mut graph = self.graph();
        let uid = graph.allocate();
        if let Some(node) = graph.nodes.get_mut(&uid) {
            node.predicates
                .insert(predicate.to_string(), Value::String(value.to_string()));
        }
        uid
    }

    /// Uids of every node whose `predicate` equals `value`
    pub fn find(&self, predicate: &str, value: &str) -> Vec<String> {
        self.graph().find(predicate, value)
    }

    /// Scalar predicates of a node
    pub fn node(&self, uid: &str) -> Option<Value> {
        self.graph()
            .nodes
            .get(uid)
            .map(|node| Value::Object(node.predicates.clone()))
    }

    /// Outgoing `likes` edges of a node
    pub fn likes(&self, uid: &str) -> Vec<String> {
        self.graph()
            .nodes
            .get(uid)
            .map(|node| node.likes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of nodes in the graph
    pub fn node_count(&self) -> usize {
        self.graph().nodes.len()
    }

    /// Number of `query` calls served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `mutate` calls served so far
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn query(&self, query: &str, vars: &Vars) -> Result<Value, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        if query.trim().starts_with("schema") {
            let graph = self.graph();
            let schema: Vec<&str> = graph
                .schema
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();
            return Ok(json!({ "schema": schema }));
        }

        let (name, predicate, var) = parse_lookup(query)
            .ok_or_else(|| StoreError::Remote(format!("unsupported query: {}", query)))?;
        let value = vars
            .get(var)
            .ok_or_else(|| StoreError::Remote(format!("variable {} not defined", var)))?;

        let uids: Vec<Value> = self
            .graph()
            .find(predicate, value)
            .into_iter()
            .map(|uid| json!({ "uid": uid }))
            .collect();

        let mut data = Map::new();
        data.insert(name.to_string(), Value::Array(uids));
        Ok(Value::Object(data))
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Assigned, StoreError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut graph = self.graph();

        if let Some(delete) = &mutation.delete {
            for object in nodes_of(delete)? {
                let uid = object
                    .get("uid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::Remote("delete requires a uid".to_string()))?;
                graph.delete_node(uid);
            }
        }

        let mut labels = HashMap::new();
        if let Some(set) = &mutation.set {
            for object in nodes_of(set)? {
                graph.set_node(object, &mut labels)?;
            }
        }

        Ok(Assigned { uids: labels })
    }

    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn alter(&self, schema: &str) -> Result<(), StoreError> {
        self.graph().schema = schema.to_string();
        Ok(())
    }
}
