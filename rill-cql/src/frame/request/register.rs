use crate::frame::{
    frame_errors::FrameError,
    request::{RequestOpcode, SerializableRequest},
    server_event_type::EventType,
    types,
    version::ProtocolVersion,
};

/// Subscribes the connection to the given classes of server-pushed events.
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let event_types_list = self
            .event_types_to_register_for
            .iter()
            .map(|event| event.to_string())
            .collect::<Vec<_>>();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}
