//! Source-priority conflict resolution
//!
//! Every node keeps parallel `SourceSystems` / `SourceSystemPriorities`
//! arrays plus one `SourceSystemProps_<system>` list per contributor. An
//! incoming write may not overwrite a property key last written by a system
//! with a *strictly greater* stored priority. Equal priority does not
//! protect: a challenger at the same priority overwrites.
//!
//! Resolution never fails. Anything anomalous about the stored record
//! (missing arrays, length mismatch) degrades to accepting every incoming
//! property and re-seeding the bookkeeping from the message.

use refinery_model::{Message, OwnershipRecord, PropMap};

/// Outcome of resolving one message against a node's current ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Incoming properties that survived priority filtering.
    pub properties: PropMap,
    /// Updated bookkeeping; `None` when the message carries no
    /// source system or priority and resolution was skipped entirely.
    pub ownership: Option<ResolvedOwnership>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOwnership {
    pub source_system: String,
    pub source_systems: Vec<String>,
    pub priorities: Vec<f64>,
    /// Property keys this writer now owns, to persist as its
    /// `SourceSystemProps_<system>` list.
    pub claimed_props: Vec<String>,
}

/// Resolve `message` against the target node's stored ownership.
///
/// `existing` is `None` when no node matched the conformed dimensions
/// inside the current transaction.
pub fn resolve(existing: Option<&OwnershipRecord>, message: &Message) -> Resolution {
    let (system, priority) = match (&message.source_system, message.priority) {
        (Some(system), Some(priority)) => (system.clone(), priority),
        // No arbitration requested: everything passes, nothing is recorded.
        _ => {
            return Resolution {
                properties: message.properties.clone(),
                ownership: None,
            }
        }
    };

    let record = match existing {
        Some(record) if record.is_coherent() && !record.source_systems.is_empty() => record,
        // First write, or bookkeeping we cannot trust: accept everything
        // and seed the arrays from this message.
        _ => {
            return Resolution {
                properties: message.properties.clone(),
                ownership: Some(ResolvedOwnership {
                    claimed_props: message.properties.keys().cloned().collect(),
                    source_system: system.clone(),
                    source_systems: vec![system],
                    priorities: vec![priority],
                }),
            }
        }
    };

    let mut source_systems = record.source_systems.clone();
    let mut priorities = record.priorities.clone();
    match source_systems.iter().position(|s| *s == system) {
        Some(idx) => priorities[idx] = priority,
        None => {
            source_systems.push(system.clone());
            priorities.push(priority);
        }
    }

    let mut properties = message.properties.clone();
    for (other, other_priority) in source_systems.iter().zip(&priorities) {
        if *other == system || *other_priority <= priority {
            continue;
        }
        if let Some(shielded) = record.props_by_system.get(other) {
            for key in shielded {
                properties.remove(key);
            }
        }
    }

    Resolution {
        ownership: Some(ResolvedOwnership {
            source_system: system,
            claimed_props: properties.keys().cloned().collect(),
            source_systems,
            priorities,
        }),
        properties,
    }
}
