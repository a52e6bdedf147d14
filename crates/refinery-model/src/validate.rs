//! Inbound schema checks
//!
//! Serde enforces field presence and shape; these checks cover the rest of
//! the harvester schema: label patterns, non-empty natural keys, and
//! priority bounds. Messages that fail here never reach the merge core and
//! map to a discard at the transport.

use crate::{Connection, Message};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

fn node_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]*$").unwrap())
}

fn source_system_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\s.'&]*$").unwrap())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("NodeType `{0}` contains characters outside [A-Za-z0-9_]")]
    BadNodeType(String),
    #[error("RelType `{0}` contains characters outside [A-Za-z0-9_]")]
    BadRelType(String),
    #[error("Label `{0}` contains characters outside [A-Za-z0-9_]")]
    BadLabel(String),
    #[error("SourceSystem `{0}` contains disallowed characters")]
    BadSourceSystem(String),
    #[error("Priority must be a finite number >= 0, got {0}")]
    BadPriority(f64),
    #[error("ConformedDimensions must contain at least one property")]
    EmptyDimensions,
    #[error("connection {index}: {source}")]
    Connection {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },
}

/// Validate one message against the harvester schema rules.
pub fn validate(message: &Message) -> Result<(), ValidationError> {
    if !node_type_re().is_match(&message.node_type) {
        return Err(ValidationError::BadNodeType(message.node_type.clone()));
    }
    if let Some(label) = &message.label {
        if !node_type_re().is_match(label) {
            return Err(ValidationError::BadLabel(label.clone()));
        }
    }
    if let Some(system) = &message.source_system {
        if !source_system_re().is_match(system) {
            return Err(ValidationError::BadSourceSystem(system.clone()));
        }
    }
    if let Some(priority) = message.priority {
        if !priority.is_finite() || priority < 0.0 {
            return Err(ValidationError::BadPriority(priority));
        }
    }
    if message.conformed_dimensions.is_empty() {
        return Err(ValidationError::EmptyDimensions);
    }
    for (index, connection) in message.connections.iter().enumerate() {
        validate_connection(connection).map_err(|source| ValidationError::Connection {
            index,
            source: Box::new(source),
        })?;
    }
    Ok(())
}

fn validate_connection(connection: &Connection) -> Result<(), ValidationError> {
    if !node_type_re().is_match(&connection.node_type) {
        return Err(ValidationError::BadNodeType(connection.node_type.clone()));
    }
    if !node_type_re().is_match(&connection.rel_type) {
        return Err(ValidationError::BadRelType(connection.rel_type.clone()));
    }
    if let Some(label) = &connection.label {
        if !node_type_re().is_match(label) {
            return Err(ValidationError::BadLabel(label.clone()));
        }
    }
    if connection.conformed_dimensions.is_empty() {
        return Err(ValidationError::EmptyDimensions);
    }
    Ok(())
}
