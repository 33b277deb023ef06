//! `panelbridge-types` – shared vocabulary of the bridge.
//!
//! Everything that crosses a queue between a panel driver and the exchange is
//! defined here: the typed [`Dataref`], the closed [`Packet`] protocol, the
//! [`LifecycleState`] both event loops report, and the [`BridgeError`] type
//! every crate returns.
//!
//! # Modules
//!
//! - [`registry`] – [`DatarefRegistry`][registry::DatarefRegistry]: the
//!   name → type table and the factory that coerces raw wire values into
//!   typed datarefs.

pub mod registry;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub use registry::DatarefRegistry;

/// The type a dataref name was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatarefType {
    /// A trigger with begin/end/once phases rather than a value.
    Command,
    /// A 32-bit signed whole number.
    Integer,
    /// A 32-bit IEEE real number.
    Float,
}

impl DatarefType {
    /// Parse the type keyword used by the text protocols.
    ///
    /// `int` is accepted as an alias of `integer`.
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "int" | "integer" => Some(Self::Integer),
            "float" => Some(Self::Float),
            "command" => Some(Self::Command),
            _ => None,
        }
    }

    /// The canonical keyword emitted on the text protocols.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Integer => "integer",
            Self::Float => "float",
        }
    }
}

impl fmt::Display for DatarefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Phase of a command dataref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPhase {
    /// The control was pressed and is being held.
    Begin,
    /// The held control was released.
    End,
    /// A single momentary activation.
    Once,
}

impl CommandPhase {
    /// Parse `begin`, `end` or `once`.
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "begin" => Some(Self::Begin),
            "end" => Some(Self::End),
            "once" => Some(Self::Once),
            _ => None,
        }
    }

    /// Legacy numeric codes: 1 = begin, 0 = end, 2 = once.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Begin),
            0 => Some(Self::End),
            2 => Some(Self::Once),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::End => "end",
            Self::Once => "once",
        }
    }
}

impl fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A typed dataref value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DatarefValue {
    Command(CommandPhase),
    Integer(i32),
    Float(f32),
}

impl DatarefValue {
    /// The [`DatarefType`] this value belongs to.
    pub fn data_type(&self) -> DatarefType {
        match self {
            Self::Command(_) => DatarefType::Command,
            Self::Integer(_) => DatarefType::Integer,
            Self::Float(_) => DatarefType::Float,
        }
    }
}

impl fmt::Display for DatarefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(phase) => write!(f, "{phase}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// An untyped value as it arrived from a transport, before the registry
/// coerces it into a [`DatarefValue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue<'a> {
    /// No value; produces a value-less dataref (subscribe requests).
    Absent,
    Text(&'a str),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Command(CommandPhase),
}

impl<'a> From<&'a str> for RawValue<'a> {
    fn from(text: &'a str) -> Self {
        RawValue::Text(text)
    }
}

impl From<i64> for RawValue<'_> {
    fn from(v: i64) -> Self {
        RawValue::Integer(v)
    }
}

impl From<i32> for RawValue<'_> {
    fn from(v: i32) -> Self {
        RawValue::Integer(i64::from(v))
    }
}

impl From<f64> for RawValue<'_> {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<f32> for RawValue<'_> {
    fn from(v: f32) -> Self {
        RawValue::Float(f64::from(v))
    }
}

impl From<bool> for RawValue<'_> {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

impl From<CommandPhase> for RawValue<'_> {
    fn from(phase: CommandPhase) -> Self {
        RawValue::Command(phase)
    }
}

/// A named, typed simulator value or command trigger.
///
/// Immutable once built.  Values produced by the
/// [`DatarefRegistry`] always match the registered type; the direct
/// constructors below exist for transports that already know the type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataref {
    name: String,
    data_type: DatarefType,
    value: Option<DatarefValue>,
}

impl Dataref {
    pub(crate) fn from_parts(
        name: impl Into<String>,
        data_type: DatarefType,
        value: Option<DatarefValue>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            value,
        }
    }

    pub fn integer(name: impl Into<String>, value: i32) -> Self {
        Self::from_parts(name, DatarefType::Integer, Some(DatarefValue::Integer(value)))
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self::from_parts(name, DatarefType::Float, Some(DatarefValue::Float(value)))
    }

    pub fn command(name: impl Into<String>, phase: CommandPhase) -> Self {
        Self::from_parts(name, DatarefType::Command, Some(DatarefValue::Command(phase)))
    }

    /// A dataref that names a type but carries no value.
    pub fn unset(name: impl Into<String>, data_type: DatarefType) -> Self {
        Self::from_parts(name, data_type, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DatarefType {
        self.data_type
    }

    pub fn value(&self) -> Option<DatarefValue> {
        self.value
    }

    /// The value, or [`BridgeError::ProtocolParse`] when the dataref is
    /// value-less.
    pub fn require_value(&self) -> Result<DatarefValue, BridgeError> {
        self.value.ok_or_else(|| {
            BridgeError::ProtocolParse(format!("dataref {} carries no value", self.name))
        })
    }
}

impl fmt::Display for Dataref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => write!(f, "{}:{}={}", self.name, self.data_type, value),
            None => write!(f, "{}:{}", self.name, self.data_type),
        }
    }
}

/// Messages exchanged between panel drivers and the exchange.
///
/// The set is closed: adding a variant forces every consumer's `match` to be
/// revisited.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "packet", content = "dataref")]
pub enum Packet {
    CommandBegin(Dataref),
    CommandEnd(Dataref),
    CommandOnce(Dataref),
    DataWrite(Dataref),
    DataSubscribeRequest(Dataref),
    SimulationStart,
    SimulationStop,
    /// Stop the receiving loop after it releases its resources.
    Shutdown,
    ExchangeAvailable,
    ExchangeUnavailable,
}

impl Packet {
    /// Build the command packet matching `phase`.
    pub fn command(dataref: Dataref, phase: CommandPhase) -> Self {
        match phase {
            CommandPhase::Begin => Packet::CommandBegin(dataref),
            CommandPhase::End => Packet::CommandEnd(dataref),
            CommandPhase::Once => Packet::CommandOnce(dataref),
        }
    }

    /// Variant name, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::CommandBegin(_) => "CommandBegin",
            Packet::CommandEnd(_) => "CommandEnd",
            Packet::CommandOnce(_) => "CommandOnce",
            Packet::DataWrite(_) => "DataWrite",
            Packet::DataSubscribeRequest(_) => "DataSubscribeRequest",
            Packet::SimulationStart => "SimulationStart",
            Packet::SimulationStop => "SimulationStop",
            Packet::Shutdown => "Shutdown",
            Packet::ExchangeAvailable => "ExchangeAvailable",
            Packet::ExchangeUnavailable => "ExchangeUnavailable",
        }
    }

    /// Split a command packet into its dataref and phase.
    pub fn command_parts(&self) -> Option<(&Dataref, CommandPhase)> {
        match self {
            Packet::CommandBegin(d) => Some((d, CommandPhase::Begin)),
            Packet::CommandEnd(d) => Some((d, CommandPhase::End)),
            Packet::CommandOnce(d) => Some((d, CommandPhase::Once)),
            _ => None,
        }
    }

    /// The dataref carried by this packet, if any.
    pub fn dataref(&self) -> Option<&Dataref> {
        match self {
            Packet::CommandBegin(d)
            | Packet::CommandEnd(d)
            | Packet::CommandOnce(d)
            | Packet::DataWrite(d)
            | Packet::DataSubscribeRequest(d) => Some(d),
            Packet::SimulationStart
            | Packet::SimulationStop
            | Packet::Shutdown
            | Packet::ExchangeAvailable
            | Packet::ExchangeUnavailable => None,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dataref() {
            Some(dataref) => write!(f, "<{} {}>", self.kind(), dataref),
            None => write!(f, "<{}>", self.kind()),
        }
    }
}

/// Lifecycle of a panel worker or the exchange loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Idle,
    Running,
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Error type shared by every panelbridge crate.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A malformed frame, line or JSON document.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("dataref {0} is not registered")]
    UnknownDataref(String),

    #[error("dataref {name} has no constructor for type {data_type}")]
    UnsupportedType { name: String, data_type: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{component} does not handle packet {packet}")]
    UnsupportedPacket { component: String, packet: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn unsupported_packet(component: impl Into<String>, packet: &Packet) -> Self {
        BridgeError::UnsupportedPacket {
            component: component.into(),
            packet: packet.kind().to_string(),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataref_type_keywords() {
        assert_eq!(DatarefType::from_keyword("int"), Some(DatarefType::Integer));
        assert_eq!(DatarefType::from_keyword("integer"), Some(DatarefType::Integer));
        assert_eq!(DatarefType::from_keyword("float"), Some(DatarefType::Float));
        assert_eq!(DatarefType::from_keyword("command"), Some(DatarefType::Command));
        assert_eq!(DatarefType::from_keyword("string"), None);
        assert_eq!(DatarefType::Integer.keyword(), "integer");
    }

    #[test]
    fn command_phase_codes_match_legacy_values() {
        assert_eq!(CommandPhase::from_code(1), Some(CommandPhase::Begin));
        assert_eq!(CommandPhase::from_code(0), Some(CommandPhase::End));
        assert_eq!(CommandPhase::from_code(2), Some(CommandPhase::Once));
        assert_eq!(CommandPhase::from_code(3), None);
        assert_eq!(CommandPhase::from_keyword("pause"), None);
    }

    #[test]
    fn packet_command_selects_variant() {
        let d = Dataref::command("sim/flaps", CommandPhase::End);
        assert!(matches!(
            Packet::command(d.clone(), CommandPhase::End),
            Packet::CommandEnd(_)
        ));
        assert!(matches!(
            Packet::command(d, CommandPhase::Once),
            Packet::CommandOnce(_)
        ));
    }

    #[test]
    fn packet_display_includes_dataref() {
        let packet = Packet::DataWrite(Dataref::float("alt", 123.4));
        assert_eq!(packet.to_string(), "<DataWrite alt:float=123.4>");
        assert_eq!(Packet::SimulationStart.to_string(), "<SimulationStart>");
        let sub = Packet::DataSubscribeRequest(Dataref::unset("gear", DatarefType::Integer));
        assert_eq!(sub.to_string(), "<DataSubscribeRequest gear:integer>");
    }

    #[test]
    fn require_value_rejects_unset_dataref() {
        let d = Dataref::unset("gear", DatarefType::Integer);
        assert!(matches!(d.require_value(), Err(BridgeError::ProtocolParse(_))));
        assert_eq!(
            Dataref::integer("gear", 1).require_value().unwrap(),
            DatarefValue::Integer(1)
        );
    }

    #[test]
    fn packet_serializes_for_status_consumers() {
        let packet = Packet::DataWrite(Dataref::integer("gear", 1));
        let json = serde_json::to_string(&packet).unwrap();
        assert!(json.contains("DataWrite"));
        assert!(json.contains("gear"));
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::UnsupportedType {
            name: "x".to_string(),
            data_type: "command".to_string(),
        };
        assert!(err.to_string().contains("command"));
        let err = BridgeError::unsupported_packet("teensy", &Packet::Shutdown);
        assert_eq!(err.to_string(), "teensy does not handle packet Shutdown");
    }
}
