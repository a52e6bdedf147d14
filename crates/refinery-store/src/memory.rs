//! In-memory reference store
//!
//! Interprets mutation programs directly against an in-process property
//! graph with the same merge semantics the Cypher rendering relies on:
//! create-or-match on labels + key properties, `ON CREATE`-only identity
//! assignment, null-valued bulk sets removing the property, optional
//! matches binding null and downstream ops no-op'ing on it.
//!
//! Sessions stage a copy of the graph and swap it in on commit, so a batch
//! is atomic and rollback is a drop. Test hooks inject failures at a chosen
//! statement, at commit, or at index creation.

use crate::{GraphStore, Record, RecordSet, Statement, StoreError, WriteSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use refinery_graph::{KeyedParam, MutationOp, MutationProgram};
use refinery_model::{PropMap, PropValue, ADDED_DATE_KEY, PENDING_MERGE_KEY, UUID_KEY};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeData {
    pub labels: BTreeSet<String>,
    pub props: PropMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelData {
    pub src: u64,
    pub dst: u64,
    pub rel_type: String,
    pub props: PropMap,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphData {
    nodes: BTreeMap<u64, NodeData>,
    rels: BTreeMap<u64, RelData>,
    next_id: u64,
}

impl GraphData {
    fn find_node(&self, labels: &[String], key: &PropMap) -> Option<u64> {
        self.nodes.iter().find_map(|(id, node)| {
            let labels_match = labels.iter().all(|l| node.labels.contains(l));
            let key_match = key
                .iter()
                .all(|(prop, value)| node.props.get(prop) == Some(value));
            (labels_match && key_match).then_some(*id)
        })
    }

    fn find_rel(&self, src: u64, dst: u64, rel_type: &str) -> Option<u64> {
        self.rels.iter().find_map(|(id, rel)| {
            (rel.src == src && rel.dst == dst && rel.rel_type == rel_type).then_some(*id)
        })
    }

    fn insert_node(&mut self, labels: &[String], props: PropMap) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            NodeData {
                labels: labels.iter().cloned().collect(),
                props,
            },
        );
        id
    }

    fn detach_delete(&mut self, id: u64) {
        self.nodes.remove(&id);
        self.rels.retain(|_, rel| rel.src != id && rel.dst != id);
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// 1-based statement ordinal (across all sessions) that should fail.
    fail_run_at: Option<(usize, StoreError)>,
    fail_commit: Option<StoreError>,
    fail_index: Option<StoreError>,
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<GraphData>,
    indexes: Mutex<BTreeSet<(String, Vec<String>)>>,
    run_count: AtomicUsize,
    index_calls: AtomicUsize,
    faults: Mutex<Faults>,
}

/// In-process graph store. Cheap to clone; clones share the same graph.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    shared: Arc<Shared>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.shared.data.lock().nodes.len()
    }

    pub fn rel_count(&self) -> usize {
        self.shared.data.lock().rels.len()
    }

    /// Properties of the committed node carrying `label` and the given key
    /// property, if any.
    pub fn find_node(&self, label: &str, key_prop: &str, value: &PropValue) -> Option<PropMap> {
        let data = self.shared.data.lock();
        data.nodes.values().find_map(|node| {
            (node.labels.contains(label) && node.props.get(key_prop) == Some(value))
                .then(|| node.props.clone())
        })
    }

    /// True when a committed relationship of `rel_type` connects the nodes
    /// identified by the given key properties, in that direction.
    pub fn has_relationship(
        &self,
        rel_type: &str,
        src: (&str, &PropValue),
        dst: (&str, &PropValue),
    ) -> bool {
        let data = self.shared.data.lock();
        data.rels.values().any(|rel| {
            rel.rel_type == rel_type
                && data
                    .nodes
                    .get(&rel.src)
                    .is_some_and(|n| n.props.get(src.0) == Some(src.1))
                && data
                    .nodes
                    .get(&rel.dst)
                    .is_some_and(|n| n.props.get(dst.0) == Some(dst.1))
        })
    }

    pub fn create_index_calls(&self) -> usize {
        self.shared.index_calls.load(Ordering::SeqCst)
    }

    /// Fail the `nth` (1-based) `run` call across all sessions with `error`.
    pub fn inject_run_failure(&self, nth: usize, error: StoreError) {
        let already = self.shared.run_count.load(Ordering::SeqCst);
        self.shared.faults.lock().fail_run_at = Some((already + nth, error));
    }

    pub fn inject_commit_failure(&self, error: StoreError) {
        self.shared.faults.lock().fail_commit = Some(error);
    }

    pub fn inject_index_failure(&self, error: StoreError) {
        self.shared.faults.lock().fail_index = Some(error);
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn begin_write(&self) -> Result<Box<dyn WriteSession>, StoreError> {
        let staged = self.shared.data.lock().clone();
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            staged,
        }))
    }

    async fn create_index(&self, label: &str, properties: &[String]) -> Result<(), StoreError> {
        self.shared.index_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.shared.faults.lock().fail_index.take() {
            return Err(err);
        }
        let key = (label.to_owned(), properties.to_vec());
        let mut indexes = self.shared.indexes.lock();
        if !indexes.insert(key) {
            return Err(StoreError::AlreadyExists(format!(
                "an equivalent index already exists on :{label}"
            )));
        }
        Ok(())
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    staged: GraphData,
}

#[async_trait]
impl WriteSession for MemorySession {
    async fn run(&mut self, statement: Statement) -> Result<RecordSet, StoreError> {
        let ordinal = self.shared.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut faults = self.shared.faults.lock();
            if faults
                .fail_run_at
                .as_ref()
                .is_some_and(|(nth, _)| *nth == ordinal)
            {
                let (_, err) = faults.fail_run_at.take().unwrap();
                return Err(err);
            }
        }

        match statement {
            Statement::FetchNode { labels, key } => {
                let record: Option<Record> = self
                    .staged
                    .find_node(&labels, &key)
                    .map(|id| self.staged.nodes[&id].props.clone());
                Ok(record.into_iter().collect())
            }
            Statement::Apply(program) => {
                // All-or-nothing per program: interpret against a scratch
                // copy and swap on success.
                let mut scratch = self.staged.clone();
                apply_program(&mut scratch, &program)?;
                self.staged = scratch;
                Ok(RecordSet::new())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(err) = self.shared.faults.lock().fail_commit.take() {
            return Err(err);
        }
        *self.shared.data.lock() = self.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

fn apply_program(graph: &mut GraphData, program: &MutationProgram) -> Result<(), StoreError> {
    let mut nodes: BTreeMap<&str, Option<u64>> = BTreeMap::new();
    let mut rels: BTreeMap<&str, Option<u64>> = BTreeMap::new();

    for op in &program.ops {
        match op {
            MutationOp::MergeNode {
                alias,
                labels,
                key,
                uuid_param,
                added_param,
                mark_pending,
            } => {
                let key_props = key_props(program, key)?;
                let id = match graph.find_node(labels, &key_props) {
                    Some(id) => id,
                    None => {
                        let mut props = key_props;
                        props.insert(UUID_KEY.into(), param(program, uuid_param)?.clone());
                        props.insert(
                            ADDED_DATE_KEY.into(),
                            param(program, added_param)?.clone(),
                        );
                        if *mark_pending {
                            props.insert(PENDING_MERGE_KEY.into(), PropValue::Bool(true));
                        }
                        graph.insert_node(labels, props)
                    }
                };
                nodes.insert(alias, Some(id));
            }
            MutationOp::MatchNode { alias, labels, key } => {
                let key_props = key_props(program, key)?;
                nodes.insert(alias, graph.find_node(labels, &key_props));
            }
            MutationOp::SetProps { alias, param: name } => {
                let map = match param(program, name)? {
                    PropValue::Map(map) => map.clone(),
                    other => {
                        return Err(StoreError::Other(format!(
                            "parameter {name} is not a map: {other:?}"
                        )))
                    }
                };
                if let Some(props) = target_props(graph, &nodes, &rels, alias) {
                    for (key, value) in map {
                        // Cypher `+=` removes a property when its value is null.
                        match value {
                            PropValue::Null => {
                                props.remove(&key);
                            }
                            value => {
                                props.insert(key, value);
                            }
                        }
                    }
                }
            }
            MutationOp::SetDateProp {
                alias,
                prop,
                param: name,
            } => {
                let value = match param(program, name)? {
                    PropValue::DateTime(dt) => PropValue::DateTime(*dt),
                    PropValue::String(raw) => chrono::DateTime::parse_from_rfc3339(raw)
                        .map(PropValue::DateTime)
                        .map_err(|e| {
                            StoreError::Other(format!("parameter {name} is not a datetime: {e}"))
                        })?,
                    other => {
                        return Err(StoreError::Other(format!(
                            "parameter {name} is not a datetime: {other:?}"
                        )))
                    }
                };
                if let Some(props) = target_props(graph, &nodes, &rels, alias) {
                    props.insert(prop.clone(), value);
                }
            }
            MutationOp::RemoveProps { alias, props: keys } => {
                if let Some(props) = target_props(graph, &nodes, &rels, alias) {
                    for key in keys {
                        props.remove(key);
                    }
                }
            }
            MutationOp::MergeRel {
                alias,
                rel_type,
                src,
                dst,
                forward,
            } => {
                let (from, to) = endpoints(&nodes, src, dst, *forward)?;
                let id = match graph.find_rel(from, to, rel_type) {
                    Some(id) => id,
                    None => {
                        let id = graph.next_id;
                        graph.next_id += 1;
                        graph.rels.insert(
                            id,
                            RelData {
                                src: from,
                                dst: to,
                                rel_type: rel_type.clone(),
                                props: PropMap::new(),
                            },
                        );
                        id
                    }
                };
                rels.insert(alias, Some(id));
            }
            MutationOp::MatchRel {
                alias,
                rel_type,
                src,
                dst,
                forward,
            } => {
                let bound = match (nodes.get(src.as_str()), nodes.get(dst.as_str())) {
                    (Some(Some(s)), Some(Some(d))) => {
                        let (from, to) = if *forward { (*s, *d) } else { (*d, *s) };
                        graph.find_rel(from, to, rel_type)
                    }
                    _ => None,
                };
                rels.insert(alias, bound);
            }
            MutationOp::DeleteRel { alias } => {
                if let Some(Some(id)) = rels.get(alias.as_str()) {
                    graph.rels.remove(id);
                }
            }
            MutationOp::DetachDeleteNode { alias } => {
                if let Some(Some(id)) = nodes.get(alias.as_str()) {
                    graph.detach_delete(*id);
                }
            }
        }
    }
    Ok(())
}

fn param<'p>(program: &'p MutationProgram, name: &str) -> Result<&'p PropValue, StoreError> {
    program
        .params
        .get(name)
        .ok_or_else(|| StoreError::Other(format!("missing statement parameter {name}")))
}

fn key_props(program: &MutationProgram, key: &[KeyedParam]) -> Result<PropMap, StoreError> {
    key.iter()
        .map(|k| Ok((k.prop.clone(), param(program, &k.param)?.clone())))
        .collect()
}

fn endpoints(
    nodes: &BTreeMap<&str, Option<u64>>,
    src: &str,
    dst: &str,
    forward: bool,
) -> Result<(u64, u64), StoreError> {
    match (nodes.get(src), nodes.get(dst)) {
        (Some(Some(s)), Some(Some(d))) => Ok(if forward { (*s, *d) } else { (*d, *s) }),
        _ => Err(StoreError::Other(format!(
            "relationship endpoints {src}/{dst} are not bound"
        ))),
    }
}

fn target_props<'g>(
    graph: &'g mut GraphData,
    nodes: &BTreeMap<&str, Option<u64>>,
    rels: &BTreeMap<&str, Option<u64>>,
    alias: &str,
) -> Option<&'g mut PropMap> {
    if let Some(Some(id)) = nodes.get(alias) {
        return graph.nodes.get_mut(id).map(|n| &mut n.props);
    }
    if let Some(Some(id)) = rels.get(alias) {
        return graph.rels.get_mut(id).map(|r| &mut r.props);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_graph::{compile, resolve, CompilerOptions};
    use refinery_model::Message;

    fn konrad() -> Message {
        serde_json::from_str(
            r#"{
                "Name": "Konrad Aust",
                "NodeType": "Employee",
                "ConformedDimensions": { "Email": "k@x.com" },
                "Properties": { "Status": "active" },
                "Connections": [{
                    "Name": "Victoria",
                    "NodeType": "Office",
                    "RelType": "LocatedInOffice",
                    "ForwardRel": true,
                    "ConformedDimensions": { "City": "Victoria" }
                }]
            }"#,
        )
        .unwrap()
    }

    async fn apply_committed(store: &MemoryGraph, message: &Message) {
        let resolution = resolve(None, message);
        let program = compile(message, &resolution, &CompilerOptions::default()).unwrap();
        let mut session = store.begin_write().await.unwrap();
        session.run(Statement::Apply(program)).await.unwrap();
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn merge_is_idempotent_and_keeps_first_identity() {
        let store = MemoryGraph::new();
        let mut msg = konrad();
        msg.connections.clear();

        apply_committed(&store, &msg).await;
        let first = store
            .find_node("Employee", "Email", &PropValue::from("k@x.com"))
            .unwrap();

        apply_committed(&store, &msg).await;
        let second = store
            .find_node("Employee", "Email", &PropValue::from("k@x.com"))
            .unwrap();

        assert_eq!(store.node_count(), 1);
        assert_eq!(first.get(UUID_KEY), second.get(UUID_KEY));
        assert_eq!(first.get(ADDED_DATE_KEY), second.get(ADDED_DATE_KEY));
    }

    #[tokio::test]
    async fn connections_merge_nodes_and_relationship() {
        let store = MemoryGraph::new();
        apply_committed(&store, &konrad()).await;

        assert_eq!(store.node_count(), 2);
        assert_eq!(store.rel_count(), 1);
        assert!(store.has_relationship(
            "LocatedInOffice",
            ("Email", &PropValue::from("k@x.com")),
            ("City", &PropValue::from("Victoria")),
        ));

        let office = store
            .find_node("Office", "City", &PropValue::from("Victoria"))
            .unwrap();
        assert_eq!(office.get(PENDING_MERGE_KEY), Some(&PropValue::Bool(true)));
        let employee = store
            .find_node("Employee", "Email", &PropValue::from("k@x.com"))
            .unwrap();
        assert_eq!(
            employee.get(PENDING_MERGE_KEY),
            Some(&PropValue::Bool(false))
        );
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = MemoryGraph::new();
        let msg = konrad();
        let resolution = resolve(None, &msg);
        let program = compile(&msg, &resolution, &CompilerOptions::default()).unwrap();

        let mut session = store.begin_write().await.unwrap();
        session.run(Statement::Apply(program)).await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn failed_commit_leaves_store_untouched() {
        let store = MemoryGraph::new();
        store.inject_commit_failure(StoreError::Transient("gone".into()));
        let msg = konrad();
        let resolution = resolve(None, &msg);
        let program = compile(&msg, &resolution, &CompilerOptions::default()).unwrap();

        let mut session = store.begin_write().await.unwrap();
        session.run(Statement::Apply(program)).await.unwrap();
        assert!(session.commit().await.is_err());
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn delete_node_detaches_relationships() {
        let store = MemoryGraph::new();
        apply_committed(&store, &konrad()).await;

        let mut msg = konrad();
        msg.delete_node = true;
        apply_committed(&store, &msg).await;

        assert_eq!(store.node_count(), 1); // office remains
        assert_eq!(store.rel_count(), 0);
        assert!(store
            .find_node("Employee", "Email", &PropValue::from("k@x.com"))
            .is_none());
    }

    #[tokio::test]
    async fn null_valued_bulk_set_removes_the_property() {
        let store = MemoryGraph::new();
        let mut msg = konrad();
        msg.connections.clear();
        apply_committed(&store, &msg).await;

        msg.properties.insert("Status".into(), PropValue::Null);
        apply_committed(&store, &msg).await;

        let node = store
            .find_node("Employee", "Email", &PropValue::from("k@x.com"))
            .unwrap();
        assert!(!node.contains_key("Status"));
    }

    #[tokio::test]
    async fn fetch_node_sees_writes_staged_in_the_same_session() {
        let store = MemoryGraph::new();
        let msg = konrad();
        let resolution = resolve(None, &msg);
        let program = compile(&msg, &resolution, &CompilerOptions::default()).unwrap();

        let mut session = store.begin_write().await.unwrap();
        session.run(Statement::Apply(program)).await.unwrap();
        let records = session
            .run(Statement::FetchNode {
                labels: vec!["Card".into(), "Employee".into()],
                key: [("Email".to_owned(), PropValue::from("k@x.com"))]
                    .into_iter()
                    .collect(),
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        session.rollback().await.unwrap();

        // Nothing committed, so the store-level view stays empty.
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn injected_run_failure_hits_the_chosen_statement() {
        let store = MemoryGraph::new();
        store.inject_run_failure(2, StoreError::Transient("blip".into()));
        let msg = konrad();
        let resolution = resolve(None, &msg);
        let program = compile(&msg, &resolution, &CompilerOptions::default()).unwrap();

        let mut session = store.begin_write().await.unwrap();
        assert!(session.run(Statement::Apply(program.clone())).await.is_ok());
        let err = session.run(Statement::Apply(program)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
