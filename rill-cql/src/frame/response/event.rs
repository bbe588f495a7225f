use crate::frame::frame_errors::CqlEventParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// A server-pushed event delivered on stream id -1 to connections that
/// REGISTERed for it.
#[derive(Debug)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    /// A node changed its tokens. The topology supervisor deliberately
    /// ignores these; the periodic refresh picks the movement up.
    MovedNode(SocketAddr),
}

#[derive(Debug)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// A schema change notification. Parsed for completeness; the driver core
/// does not react to these beyond logging.
#[derive(Debug)]
pub struct SchemaChangeEvent {
    pub change_type: String,
    pub target: String,
    pub keyspace_name: String,
    pub object_name: Option<String>,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => {
                Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?))
            }
            EventType::SchemaChange => {
                Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?))
            }
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let type_of_change =
            types::read_string(buf).map_err(CqlEventParseError::TypeOfChangeParseError)?;
        let addr = types::read_inet(buf).map_err(CqlEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(CqlEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let type_of_change =
            types::read_string(buf).map_err(CqlEventParseError::TypeOfChangeParseError)?;
        let addr = types::read_inet(buf).map_err(CqlEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(CqlEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let change_type = types::read_string(buf)
            .map_err(CqlEventParseError::SchemaChangeEventParseError)?
            .to_string();
        let target = types::read_string(buf)
            .map_err(CqlEventParseError::SchemaChangeEventParseError)?
            .to_string();
        let keyspace_name = types::read_string(buf)
            .map_err(CqlEventParseError::SchemaChangeEventParseError)?
            .to_string();

        let object_name = match target.as_str() {
            "KEYSPACE" => None,
            "TABLE" | "TYPE" | "FUNCTION" | "AGGREGATE" => Some(
                types::read_string(buf)
                    .map_err(CqlEventParseError::SchemaChangeEventParseError)?
                    .to_string(),
            ),
            _ => return Err(CqlEventParseError::UnknownTargetOfSchemaChange(target)),
        };

        Ok(Self {
            change_type,
            target,
            keyspace_name,
            object_name,
        })
    }
}
