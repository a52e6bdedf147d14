//! Graph mutation compiler
//!
//! Compiles one message plus its conflict resolution into a single
//! parameterized [`MutationProgram`]: create-or-match for the primary
//! entity, typed date sets, property deletions, then one create-or-match
//! plus a directed relationship merge per connection. First creation
//! assigns the node's Uuid and AddedDate; both are immutable afterwards.

use crate::cypher::{KeyedParam, MutationOp, MutationProgram, PRIMARY_ALIAS};
use crate::dates::split_date_properties;
use crate::resolver::Resolution;
use chrono::Utc;
use refinery_model::{
    source_system_props_key, Connection, Message, PropMap, PropValue, NAME_KEY,
    PENDING_MERGE_KEY, SOURCE_SYSTEMS_KEY, SOURCE_SYSTEM_PRIORITIES_KEY,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    /// Permanent: a message without a natural key cannot address a node.
    #[error("ConformedDimensions is empty; message cannot address a node")]
    EmptyDimensions,
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Reclassify ISO-8601 string properties as typed date sets.
    pub infer_dates: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self { infer_dates: true }
    }
}

/// Compile `message` into one mutation program.
///
/// `resolution` carries the priority-filtered property set and the updated
/// ownership bookkeeping for the primary entity.
pub fn compile(
    message: &Message,
    resolution: &Resolution,
    options: &CompilerOptions,
) -> Result<MutationProgram, CompileError> {
    if message.conformed_dimensions.is_empty() {
        return Err(CompileError::EmptyDimensions);
    }

    let mut program = MutationProgram::default();

    if message.delete_node {
        // Deletion supersedes every other operation in the message.
        let key = bind_key(&mut program, "", &message.conformed_dimensions);
        program.ops.push(MutationOp::MatchNode {
            alias: PRIMARY_ALIAS.into(),
            labels: message.labels(),
            key,
        });
        program.ops.push(MutationOp::DetachDeleteNode {
            alias: PRIMARY_ALIAS.into(),
        });
        return Ok(program);
    }

    compile_primary(&mut program, message, resolution, options);
    for (index, connection) in message.connections.iter().enumerate() {
        compile_connection(&mut program, index, connection, options);
    }
    Ok(program)
}

fn compile_primary(
    program: &mut MutationProgram,
    message: &Message,
    resolution: &Resolution,
    options: &CompilerOptions,
) {
    let split = split_date_properties(
        &resolution.properties,
        &message.date_properties,
        options.infer_dates,
    );

    let key = bind_key(program, "", &message.conformed_dimensions);
    program.ops.push(MutationOp::MergeNode {
        alias: PRIMARY_ALIAS.into(),
        labels: message.labels(),
        key,
        uuid_param: "newUuid".into(),
        added_param: "addedDate".into(),
        mark_pending: false,
    });
    program.param("newUuid", Uuid::new_v4().to_string());
    program.param(
        "addedDate",
        PropValue::DateTime(Utc::now().fixed_offset()),
    );

    let mut node_params = split.plain;
    node_params.extend(message.conformed_dimensions.clone());
    node_params.insert(NAME_KEY.into(), PropValue::from(message.name.clone()));
    node_params.insert(PENDING_MERGE_KEY.into(), PropValue::Bool(false));
    if let Some(ownership) = &resolution.ownership {
        node_params.insert(
            SOURCE_SYSTEMS_KEY.into(),
            string_list(&ownership.source_systems),
        );
        node_params.insert(
            SOURCE_SYSTEM_PRIORITIES_KEY.into(),
            float_list(&ownership.priorities),
        );
        node_params.insert(
            source_system_props_key(&ownership.source_system),
            string_list(&ownership.claimed_props),
        );
    }
    program.param("nodeParams", PropValue::Map(node_params));
    program.ops.push(MutationOp::SetProps {
        alias: PRIMARY_ALIAS.into(),
        param: "nodeParams".into(),
    });

    for (index, (prop, dt)) in split.dates.iter().enumerate() {
        let param = format!("nodeDate{index}");
        program.param(param.clone(), PropValue::DateTime(*dt));
        program.ops.push(MutationOp::SetDateProp {
            alias: PRIMARY_ALIAS.into(),
            prop: prop.clone(),
            param,
        });
    }

    if !message.delete_properties.is_empty() {
        program.ops.push(MutationOp::RemoveProps {
            alias: PRIMARY_ALIAS.into(),
            props: message.delete_properties.clone(),
        });
    }
}

fn compile_connection(
    program: &mut MutationProgram,
    index: usize,
    connection: &Connection,
    options: &CompilerOptions,
) {
    // An unkeyed connection compiles to nothing.
    if connection.conformed_dimensions.is_empty() {
        return;
    }

    let alias = format!("node{index}");
    let rel_alias = format!("{alias}_rel");
    let key = bind_key(
        program,
        &format!("{alias}_"),
        &connection.conformed_dimensions,
    );

    if connection.delete_node {
        // Detach-delete covers the relationship as well.
        program.ops.push(MutationOp::MatchNode {
            alias: alias.clone(),
            labels: connection.labels(),
            key,
        });
        program.ops.push(MutationOp::DetachDeleteNode { alias });
        return;
    }

    program.ops.push(MutationOp::MergeNode {
        alias: alias.clone(),
        labels: connection.labels(),
        key,
        uuid_param: format!("{alias}_newUuid"),
        added_param: format!("{alias}_addedDate"),
        mark_pending: true,
    });
    program.param(format!("{alias}_newUuid"), Uuid::new_v4().to_string());
    program.param(
        format!("{alias}_addedDate"),
        PropValue::DateTime(Utc::now().fixed_offset()),
    );

    let split = split_date_properties(
        &connection.properties,
        &connection.date_properties,
        options.infer_dates,
    );
    let mut node_params = split.plain;
    node_params.extend(connection.conformed_dimensions.clone());
    if let Some(name) = &connection.name {
        node_params.insert(NAME_KEY.into(), PropValue::from(name.clone()));
    }
    program.param(format!("{alias}_nodeParams"), PropValue::Map(node_params));
    program.ops.push(MutationOp::SetProps {
        alias: alias.clone(),
        param: format!("{alias}_nodeParams"),
    });

    for (date_index, (prop, dt)) in split.dates.iter().enumerate() {
        let param = format!("{alias}_date{date_index}");
        program.param(param.clone(), PropValue::DateTime(*dt));
        program.ops.push(MutationOp::SetDateProp {
            alias: alias.clone(),
            prop: prop.clone(),
            param,
        });
    }

    if !connection.delete_properties.is_empty() {
        program.ops.push(MutationOp::RemoveProps {
            alias: alias.clone(),
            props: connection.delete_properties.clone(),
        });
    }

    if connection.delete_relationship {
        // Ensure absence without creating the edge first; deleting the
        // relationship supersedes its property operations.
        program.ops.push(MutationOp::MatchRel {
            alias: rel_alias.clone(),
            rel_type: connection.rel_type.clone(),
            src: PRIMARY_ALIAS.into(),
            dst: alias,
            forward: connection.forward_rel,
        });
        program.ops.push(MutationOp::DeleteRel { alias: rel_alias });
        return;
    }

    program.ops.push(MutationOp::MergeRel {
        alias: rel_alias.clone(),
        rel_type: connection.rel_type.clone(),
        src: PRIMARY_ALIAS.into(),
        dst: alias.clone(),
        forward: connection.forward_rel,
    });

    let rel_split = split_date_properties(
        &connection.rel_props,
        &connection.date_rel_props,
        options.infer_dates,
    );
    program.param(
        format!("{alias}_relProps"),
        PropValue::Map(rel_split.plain),
    );
    program.ops.push(MutationOp::SetProps {
        alias: rel_alias.clone(),
        param: format!("{alias}_relProps"),
    });

    for (date_index, (prop, dt)) in rel_split.dates.iter().enumerate() {
        let param = format!("{alias}_relDate{date_index}");
        program.param(param.clone(), PropValue::DateTime(*dt));
        program.ops.push(MutationOp::SetDateProp {
            alias: rel_alias.clone(),
            prop: prop.clone(),
            param,
        });
    }

    if !connection.delete_rel_props.is_empty() {
        program.ops.push(MutationOp::RemoveProps {
            alias: rel_alias,
            props: connection.delete_rel_props.clone(),
        });
    }
}

fn bind_key(program: &mut MutationProgram, prefix: &str, dims: &PropMap) -> Vec<KeyedParam> {
    dims.iter()
        .enumerate()
        .map(|(index, (prop, value))| {
            let param = format!("{prefix}key{index}");
            program.param(param.clone(), value.clone());
            KeyedParam {
                prop: prop.clone(),
                param,
            }
        })
        .collect()
}

fn string_list(items: &[String]) -> PropValue {
    PropValue::List(items.iter().cloned().map(PropValue::String).collect())
}

fn float_list(items: &[f64]) -> PropValue {
    PropValue::List(items.iter().copied().map(PropValue::Float).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;

    fn passthrough(message: &Message) -> Resolution {
        resolve(None, message)
    }

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

    #[test]
    fn empty_dimensions_do_not_compile() {
        let mut msg = konrad();
        msg.conformed_dimensions.clear();
        let err = compile(&msg, &passthrough(&msg), &CompilerOptions::default());
        assert_eq!(err, Err(CompileError::EmptyDimensions));
    }

    #[test]
    fn primary_ops_precede_connection_ops() {
        let msg = konrad();
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();

        let kinds: Vec<&str> = program
            .ops
            .iter()
            .map(|op| match op {
                MutationOp::MergeNode { alias, .. } => {
                    if alias == "node" {
                        "merge-primary"
                    } else {
                        "merge-connection"
                    }
                }
                MutationOp::MergeRel { .. } => "merge-rel",
                MutationOp::SetProps { .. } => "set",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["merge-primary", "set", "merge-connection", "set", "merge-rel", "set"]
        );
    }

    #[test]
    fn end_to_end_employee_office_program() {
        let msg = konrad();
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();
        let cypher = program.to_cypher();

        assert!(cypher.contains("MERGE (node:Card:Employee {Email: $key0})"));
        assert!(cypher.contains("MERGE (node0:Card:Office {City: $node0_key0})"));
        assert!(cypher.contains("MERGE (node)-[node0_rel:LocatedInOffice]->(node0)"));
        assert!(cypher.contains("node0.PendingMerge = true"));

        // Identity params exist and are distinct per entity.
        let uuid = program.params.get("newUuid").unwrap().as_str().unwrap();
        let conn_uuid = program.params.get("node0_newUuid").unwrap().as_str().unwrap();
        assert_ne!(uuid, conn_uuid);

        // The primary merge map carries Name, dims, and PendingMerge=false.
        match program.params.get("nodeParams").unwrap() {
            PropValue::Map(map) => {
                assert_eq!(map.get(NAME_KEY), Some(&PropValue::from("Konrad Aust")));
                assert_eq!(map.get("Email"), Some(&PropValue::from("k@x.com")));
                assert_eq!(map.get(PENDING_MERGE_KEY), Some(&PropValue::Bool(false)));
            }
            other => panic!("nodeParams should be a map, got {other:?}"),
        }
    }

    #[test]
    fn ownership_bookkeeping_lands_in_the_merge_map() {
        let mut msg = konrad();
        msg.source_system = Some("HRSystem".into());
        msg.priority = Some(1.0);
        let resolution = resolve(None, &msg);
        let program = compile(&msg, &resolution, &CompilerOptions::default()).unwrap();

        match program.params.get("nodeParams").unwrap() {
            PropValue::Map(map) => {
                assert_eq!(
                    map.get(SOURCE_SYSTEMS_KEY),
                    Some(&string_list(&["HRSystem".to_owned()]))
                );
                assert_eq!(
                    map.get(SOURCE_SYSTEM_PRIORITIES_KEY),
                    Some(&float_list(&[1.0]))
                );
                assert!(map.contains_key("SourceSystemProps_HRSystem"));
            }
            other => panic!("nodeParams should be a map, got {other:?}"),
        }
    }

    #[test]
    fn iso_strings_become_typed_date_sets() {
        let mut msg = konrad();
        msg.properties
            .insert("HireDate".into(), PropValue::from("2020-01-01T00:00:00Z"));
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();

        assert!(program.ops.iter().any(|op| matches!(
            op,
            MutationOp::SetDateProp { prop, .. } if prop == "HireDate"
        )));
        match program.params.get("nodeParams").unwrap() {
            PropValue::Map(map) => assert!(!map.contains_key("HireDate")),
            other => panic!("nodeParams should be a map, got {other:?}"),
        }
        assert!(program.to_cypher().contains("SET node.HireDate = datetime($nodeDate0)"));
    }

    #[test]
    fn delete_node_supersedes_everything_else() {
        let mut msg = konrad();
        msg.delete_node = true;
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();
        assert_eq!(program.ops.len(), 2);
        assert!(matches!(program.ops[0], MutationOp::MatchNode { .. }));
        assert!(matches!(program.ops[1], MutationOp::DetachDeleteNode { .. }));
    }

    #[test]
    fn delete_properties_follow_all_sets() {
        let mut msg = konrad();
        msg.connections.clear();
        msg.delete_properties = vec!["Obsolete".into()];
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();
        assert!(matches!(
            program.ops.last().unwrap(),
            MutationOp::RemoveProps { props, .. } if props == &vec!["Obsolete".to_owned()]
        ));
    }

    #[test]
    fn delete_relationship_matches_instead_of_merging() {
        let mut msg = konrad();
        msg.connections[0].delete_relationship = true;
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();

        assert!(!program
            .ops
            .iter()
            .any(|op| matches!(op, MutationOp::MergeRel { .. })));
        assert!(program
            .ops
            .iter()
            .any(|op| matches!(op, MutationOp::MatchRel { .. })));
        assert!(program
            .ops
            .iter()
            .any(|op| matches!(op, MutationOp::DeleteRel { .. })));
        let cypher = program.to_cypher();
        assert!(cypher.contains("WITH *"));
        assert!(cypher.contains("OPTIONAL MATCH (node)-[node0_rel:LocatedInOffice]->(node0)"));
    }

    #[test]
    fn connection_delete_node_detaches_it() {
        let mut msg = konrad();
        msg.connections[0].delete_node = true;
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();
        assert!(program.ops.iter().any(
            |op| matches!(op, MutationOp::DetachDeleteNode { alias } if alias == "node0")
        ));
        assert!(!program
            .ops
            .iter()
            .any(|op| matches!(op, MutationOp::MergeRel { .. })));
    }

    #[test]
    fn unkeyed_connections_compile_to_nothing() {
        let mut msg = konrad();
        msg.connections[0].conformed_dimensions.clear();
        let program = compile(&msg, &passthrough(&msg), &CompilerOptions::default()).unwrap();
        assert!(!program
            .ops
            .iter()
            .any(|op| matches!(op, MutationOp::MergeNode { alias, .. } if alias == "node0")));
    }
}
