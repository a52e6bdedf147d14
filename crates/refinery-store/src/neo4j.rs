//! Neo4j bolt backend
//!
//! Renders mutation programs to Cypher and runs them inside one driver
//! transaction per batch. Ownership reads project the bookkeeping fields
//! only; whole-node fetches are never needed.
//!
//! Typed temporal parameters travel as RFC 3339 strings and are cast with
//! `datetime($param)` in the rendered statement.

use crate::{GraphStore, Record, RecordSet, Statement, StoreError, WriteSession};
use async_trait::async_trait;
use neo4rs::{query, BoltType, Graph, Query, Txn};
use refinery_graph::MutationProgram;
use refinery_model::{
    source_system_props_key, PropMap, PropValue, SOURCE_SYSTEMS_KEY,
    SOURCE_SYSTEM_PRIORITIES_KEY,
};
use std::collections::HashMap;
use tracing::debug;

/// Store handle over one bolt connection pool.
pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, StoreError> {
        let graph = Graph::new(uri, user, password).await.map_err(driver_err)?;
        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn begin_write(&self) -> Result<Box<dyn WriteSession>, StoreError> {
        let txn = self.graph.start_txn().await.map_err(driver_err)?;
        Ok(Box::new(Neo4jSession { txn }))
    }

    async fn create_index(&self, label: &str, properties: &[String]) -> Result<(), StoreError> {
        let columns: Vec<String> = properties.iter().map(|p| format!("n.{}", backtick(p))).collect();
        let statement = format!(
            "CREATE INDEX FOR (n:{}) ON ({})",
            backtick(label),
            columns.join(", ")
        );
        debug!(%statement, "ensuring index");
        self.graph.run(query(&statement)).await.map_err(driver_err)
    }
}

struct Neo4jSession {
    txn: Txn,
}

#[async_trait]
impl WriteSession for Neo4jSession {
    async fn run(&mut self, statement: Statement) -> Result<RecordSet, StoreError> {
        match statement {
            Statement::FetchNode { labels, key } => self.fetch_node(&labels, &key).await,
            Statement::Apply(program) => {
                let q = build_query(&program);
                self.txn.run(q).await.map_err(driver_err)?;
                Ok(RecordSet::new())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.commit().await.map_err(driver_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.rollback().await.map_err(driver_err)
    }
}

impl Neo4jSession {
    /// Read a node's ownership bookkeeping inside the open transaction.
    ///
    /// Two projections: the parallel system/priority arrays first, then one
    /// `SourceSystemProps_<system>` column per recorded system. Property
    /// names are only known after the first read.
    async fn fetch_node(
        &mut self,
        labels: &[String],
        key: &PropMap,
    ) -> Result<RecordSet, StoreError> {
        let match_clause = render_match(labels, key);

        let text = format!(
            "{match_clause} RETURN node.{SOURCE_SYSTEMS_KEY} AS systems, \
             node.{SOURCE_SYSTEM_PRIORITIES_KEY} AS priorities"
        );
        let mut stream = self
            .txn
            .execute(keyed_query(&text, key))
            .await
            .map_err(driver_err)?;
        let row = match stream.next(&mut self.txn).await.map_err(driver_err)? {
            Some(row) => row,
            None => return Ok(RecordSet::new()),
        };
        let systems: Vec<String> = row.get("systems").unwrap_or_default();
        let priorities: Vec<f64> = row.get("priorities").unwrap_or_default();

        let mut record = Record::new();
        record.insert(
            SOURCE_SYSTEMS_KEY.into(),
            PropValue::List(systems.iter().cloned().map(PropValue::String).collect()),
        );
        record.insert(
            SOURCE_SYSTEM_PRIORITIES_KEY.into(),
            PropValue::List(priorities.iter().copied().map(PropValue::Float).collect()),
        );

        if !systems.is_empty() {
            let columns: Vec<String> = systems
                .iter()
                .enumerate()
                .map(|(i, system)| {
                    format!("node.{} AS p{i}", backtick(&source_system_props_key(system)))
                })
                .collect();
            let text = format!("{match_clause} RETURN {}", columns.join(", "));
            let mut stream = self
                .txn
                .execute(keyed_query(&text, key))
                .await
                .map_err(driver_err)?;
            if let Some(row) = stream.next(&mut self.txn).await.map_err(driver_err)? {
                for (i, system) in systems.iter().enumerate() {
                    let owned: Vec<String> = row.get(&format!("p{i}")).unwrap_or_default();
                    record.insert(
                        source_system_props_key(system),
                        PropValue::List(owned.into_iter().map(PropValue::String).collect()),
                    );
                }
            }
        }

        Ok(vec![record])
    }
}

fn render_match(labels: &[String], key: &PropMap) -> String {
    let label_part: String = labels.iter().map(|l| format!(":{}", backtick(l))).collect();
    let key_part: Vec<String> = key
        .keys()
        .enumerate()
        .map(|(i, prop)| format!("{}: $k{i}", backtick(prop)))
        .collect();
    format!("MATCH (node{label_part} {{{}}})", key_part.join(", "))
}

fn keyed_query(text: &str, key: &PropMap) -> Query {
    let mut q = query(text);
    for (i, value) in key.values().enumerate() {
        q = q.param(&format!("k{i}"), to_bolt(value));
    }
    q
}

fn build_query(program: &MutationProgram) -> Query {
    let mut q = query(&program.to_cypher());
    for (name, value) in &program.params {
        q = q.param(name, to_bolt(value));
    }
    q
}

fn to_bolt(value: &PropValue) -> BoltType {
    match value {
        PropValue::Null => BoltType::from(None::<String>),
        PropValue::Bool(b) => (*b).into(),
        PropValue::Int(i) => (*i).into(),
        PropValue::Float(f) => (*f).into(),
        PropValue::String(s) => s.clone().into(),
        PropValue::DateTime(dt) => dt.to_rfc3339().into(),
        PropValue::List(items) => items.iter().map(to_bolt).collect::<Vec<BoltType>>().into(),
        PropValue::Map(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), to_bolt(v)))
            .collect::<HashMap<String, BoltType>>()
            .into(),
    }
}

fn backtick(name: &str) -> String {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_owned()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

fn driver_err(err: neo4rs::Error) -> StoreError {
    StoreError::classify(&format!("{err:?}"))
}
