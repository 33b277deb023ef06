//! Parser for the panel-side text protocol.
//!
//! ```text
//! register <name> <int|integer|float|command>
//! command <name> <begin|end|once>
//! write <name> <value>
//! ```

use panelbridge_types::{BridgeError, CommandPhase, Dataref, DatarefRegistry, DatarefType, Packet};

/// Turn one panel line into the packet it asks for.
///
/// `register` records the name's type in `registry` (first registration
/// wins) and yields a subscribe request.
///
/// # Errors
///
/// * [`BridgeError::ProtocolParse`] – unknown verb, wrong arity, unknown
///   command action or a value that does not parse.
/// * [`BridgeError::UnsupportedType`] – unknown type keyword in `register`.
/// * [`BridgeError::UnknownDataref`] – `command`/`write` for a name that was
///   never registered.
pub fn parse_panel_line(line: &str, registry: &DatarefRegistry) -> Result<Packet, BridgeError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["register", name, type_word] => {
            let data_type = DatarefType::from_keyword(type_word).ok_or_else(|| {
                BridgeError::UnsupportedType {
                    name: (*name).to_string(),
                    data_type: (*type_word).to_string(),
                }
            })?;
            registry.register(name, data_type);
            let data_type = registry.data_type(name).unwrap_or(data_type);
            Ok(Packet::DataSubscribeRequest(Dataref::unset(*name, data_type)))
        }
        ["command", name, action] => {
            let phase = CommandPhase::from_keyword(action).ok_or_else(|| {
                BridgeError::ProtocolParse(format!("unsupported command action: {action}"))
            })?;
            let dataref = registry.factory(name, phase)?;
            Ok(Packet::command(dataref, phase))
        }
        ["write", name, value] => Ok(Packet::DataWrite(registry.factory(name, *value)?)),
        _ => Err(BridgeError::ProtocolParse(format!("unrecognised panel line: {line}"))),
    }
}
