//! Mutation program AST and Cypher rendering
//!
//! The compiler emits a flat list of tagged operations plus one parameter
//! map. Wire backends render the ops to a single parameterized Cypher
//! statement; the in-memory store interprets the ops directly. Keeping the
//! program structured (rather than string-built) preserves the ordering
//! guarantee that the primary entity's operations precede its connections'.

use refinery_model::{PropMap, PropValue, ADDED_DATE_KEY, PENDING_MERGE_KEY, UUID_KEY};
use serde::{Deserialize, Serialize};

/// Alias of the primary entity inside a program.
pub const PRIMARY_ALIAS: &str = "node";

/// One (property name, parameter name) pair of a node's natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedParam {
    pub prop: String,
    pub param: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    /// `MERGE (alias:A:B {key})` with first-creation identity assignment.
    MergeNode {
        alias: String,
        labels: Vec<String>,
        key: Vec<KeyedParam>,
        uuid_param: String,
        added_param: String,
        /// Side-created nodes get `PendingMerge = true` on creation.
        mark_pending: bool,
    },
    /// `OPTIONAL MATCH (alias:A:B {key})`, used by deletions so that
    /// ensuring absence never creates the node first.
    MatchNode {
        alias: String,
        labels: Vec<String>,
        key: Vec<KeyedParam>,
    },
    /// `SET alias += $param` (bulk map merge; node or relationship alias).
    SetProps { alias: String, param: String },
    /// `SET alias.prop = datetime($param)`; typed temporal values cannot
    /// ride in a bulk map merge.
    SetDateProp {
        alias: String,
        prop: String,
        param: String,
    },
    /// `REMOVE alias.p1, alias.p2, ...`
    RemoveProps { alias: String, props: Vec<String> },
    /// `MERGE (src)-[alias:TYPE]->(dst)`; arrow flips when `forward` is
    /// false.
    MergeRel {
        alias: String,
        rel_type: String,
        src: String,
        dst: String,
        forward: bool,
    },
    /// `OPTIONAL MATCH (src)-[alias:TYPE]->(dst)` for relationship removal.
    MatchRel {
        alias: String,
        rel_type: String,
        src: String,
        dst: String,
        forward: bool,
    },
    /// `DELETE alias` (relationship).
    DeleteRel { alias: String },
    /// `DETACH DELETE alias` (node).
    DetachDeleteNode { alias: String },
}

/// A compiled, parameterized mutation program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationProgram {
    pub ops: Vec<MutationOp>,
    pub params: PropMap,
}

impl MutationProgram {
    pub fn param(&mut self, name: impl Into<String>, value: impl Into<PropValue>) {
        self.params.insert(name.into(), value.into());
    }

    /// Render the program as one Cypher statement.
    ///
    /// A `WITH *` separator is inserted whenever a read clause follows a
    /// write clause, as Cypher requires.
    pub fn to_cypher(&self) -> String {
        let mut clauses: Vec<String> = Vec::new();
        let mut pending_write = false;

        for op in &self.ops {
            match op {
                MutationOp::MergeNode {
                    alias,
                    labels,
                    key,
                    uuid_param,
                    added_param,
                    mark_pending,
                } => {
                    clauses.push(format!(
                        "MERGE ({alias}{} {})",
                        render_labels(labels),
                        render_key(key)
                    ));
                    let mut on_create = format!(
                        "ON CREATE SET {alias}.{UUID_KEY} = ${uuid_param}, \
                         {alias}.{ADDED_DATE_KEY} = datetime(${added_param})"
                    );
                    if *mark_pending {
                        on_create.push_str(&format!(", {alias}.{PENDING_MERGE_KEY} = true"));
                    }
                    clauses.push(on_create);
                    pending_write = true;
                }
                MutationOp::MatchNode { alias, labels, key } => {
                    if pending_write {
                        clauses.push("WITH *".into());
                        pending_write = false;
                    }
                    clauses.push(format!(
                        "OPTIONAL MATCH ({alias}{} {})",
                        render_labels(labels),
                        render_key(key)
                    ));
                }
                MutationOp::SetProps { alias, param } => {
                    clauses.push(format!("SET {alias} += ${param}"));
                    pending_write = true;
                }
                MutationOp::SetDateProp { alias, prop, param } => {
                    clauses.push(format!(
                        "SET {alias}.{} = datetime(${param})",
                        escape_name(prop)
                    ));
                    pending_write = true;
                }
                MutationOp::RemoveProps { alias, props } => {
                    let removed: Vec<String> = props
                        .iter()
                        .map(|p| format!("{alias}.{}", escape_name(p)))
                        .collect();
                    clauses.push(format!("REMOVE {}", removed.join(", ")));
                    pending_write = true;
                }
                MutationOp::MergeRel {
                    alias,
                    rel_type,
                    src,
                    dst,
                    forward,
                } => {
                    clauses.push(format!(
                        "MERGE {}",
                        render_rel_pattern(alias, rel_type, src, dst, *forward)
                    ));
                    pending_write = true;
                }
                MutationOp::MatchRel {
                    alias,
                    rel_type,
                    src,
                    dst,
                    forward,
                } => {
                    if pending_write {
                        clauses.push("WITH *".into());
                        pending_write = false;
                    }
                    clauses.push(format!(
                        "OPTIONAL MATCH {}",
                        render_rel_pattern(alias, rel_type, src, dst, *forward)
                    ));
                }
                MutationOp::DeleteRel { alias } => {
                    clauses.push(format!("DELETE {alias}"));
                    pending_write = true;
                }
                MutationOp::DetachDeleteNode { alias } => {
                    clauses.push(format!("DETACH DELETE {alias}"));
                    pending_write = true;
                }
            }
        }

        clauses.join("\n")
    }
}

fn render_labels(labels: &[String]) -> String {
    labels
        .iter()
        .map(|l| format!(":{l}"))
        .collect::<Vec<_>>()
        .join("")
}

fn render_key(key: &[KeyedParam]) -> String {
    let pairs: Vec<String> = key
        .iter()
        .map(|k| format!("{}: ${}", escape_name(&k.prop), k.param))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

fn render_rel_pattern(alias: &str, rel_type: &str, src: &str, dst: &str, forward: bool) -> String {
    if forward {
        format!("({src})-[{alias}:{rel_type}]->({dst})")
    } else {
        format!("({src})<-[{alias}:{rel_type}]-({dst})")
    }
}

/// Backtick-escape arbitrary property names; labels and relationship types
/// are pattern-checked upstream and render bare.
fn escape_name(name: &str) -> String {
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.is_empty()
    {
        name.to_owned()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_set_render_in_order() {
        let program = MutationProgram {
            ops: vec![
                MutationOp::MergeNode {
                    alias: "node".into(),
                    labels: vec!["Card".into(), "Employee".into()],
                    key: vec![KeyedParam {
                        prop: "Email".into(),
                        param: "key0".into(),
                    }],
                    uuid_param: "newUuid".into(),
                    added_param: "addedDate".into(),
                    mark_pending: false,
                },
                MutationOp::SetProps {
                    alias: "node".into(),
                    param: "nodeParams".into(),
                },
            ],
            params: PropMap::new(),
        };
        let cypher = program.to_cypher();
        assert_eq!(
            cypher,
            "MERGE (node:Card:Employee {Email: $key0})\n\
             ON CREATE SET node.Uuid = $newUuid, node.AddedDate = datetime($addedDate)\n\
             SET node += $nodeParams"
        );
    }

    #[test]
    fn pending_nodes_get_flagged_on_create() {
        let program = MutationProgram {
            ops: vec![MutationOp::MergeNode {
                alias: "node0".into(),
                labels: vec!["Card".into(), "Office".into()],
                key: vec![KeyedParam {
                    prop: "City".into(),
                    param: "node0_key0".into(),
                }],
                uuid_param: "node0_newUuid".into(),
                added_param: "node0_addedDate".into(),
                mark_pending: true,
            }],
            params: PropMap::new(),
        };
        assert!(program.to_cypher().contains("node0.PendingMerge = true"));
    }

    #[test]
    fn reverse_relationships_flip_the_arrow() {
        let forward = render_rel_pattern("r", "Owns", "node", "node0", true);
        let reverse = render_rel_pattern("r", "Owns", "node", "node0", false);
        assert_eq!(forward, "(node)-[r:Owns]->(node0)");
        assert_eq!(reverse, "(node)<-[r:Owns]-(node0)");
    }

    #[test]
    fn reads_after_writes_are_separated_by_with() {
        let program = MutationProgram {
            ops: vec![
                MutationOp::MergeNode {
                    alias: "node".into(),
                    labels: vec!["Card".into()],
                    key: vec![KeyedParam {
                        prop: "K".into(),
                        param: "key0".into(),
                    }],
                    uuid_param: "newUuid".into(),
                    added_param: "addedDate".into(),
                    mark_pending: false,
                },
                MutationOp::MatchNode {
                    alias: "node0".into(),
                    labels: vec!["Card".into()],
                    key: vec![KeyedParam {
                        prop: "K".into(),
                        param: "node0_key0".into(),
                    }],
                },
                MutationOp::DetachDeleteNode {
                    alias: "node0".into(),
                },
            ],
            params: PropMap::new(),
        };
        let cypher = program.to_cypher();
        let with_pos = cypher.find("WITH *").expect("WITH separator");
        let match_pos = cypher.find("OPTIONAL MATCH").unwrap();
        assert!(with_pos < match_pos);
    }

    #[test]
    fn odd_property_names_are_backticked() {
        assert_eq!(escape_name("Email"), "Email");
        assert_eq!(escape_name("First Name"), "`First Name`");
        assert_eq!(escape_name("we`ird"), "`we``ird`");
    }
}
