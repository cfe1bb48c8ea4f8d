//! Register catalog interface.
//!
//! The catalog (which register ids exist, their wire types, writability,
//! and validation rules) is table-driven external configuration supplied
//! by the host application, never hard-coded here (see spec §1, §9: "the
//! core selects behavior by tag, not by type hierarchy"). This module only
//! defines the shape of that table and the trait the core calls into.

use crate::error::TerminalError;

/// How a register's value is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Float32Be,
    Uint8,
    Uint16Be,
    Uint32Be,
    EnumU8,
    StringAscii,
}

/// A decoded or pre-encode register value.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    F32(f32),
    U8(u8),
    U16(u16),
    U32(u32),
    Str(String),
}

impl RegisterValue {
    /// Encode this value to wire bytes per `wire_type`. `float32` and
    /// `uint16`/`uint32` are big-endian.
    pub fn encode(&self, wire_type: WireType, id: u32) -> Result<Vec<u8>, TerminalError> {
        match (wire_type, self) {
            (WireType::Float32Be, RegisterValue::F32(v)) => Ok(v.to_be_bytes().to_vec()),
            (WireType::Uint8, RegisterValue::U8(v)) => Ok(vec![*v]),
            (WireType::Uint16Be, RegisterValue::U16(v)) => Ok(v.to_be_bytes().to_vec()),
            (WireType::Uint32Be, RegisterValue::U32(v)) => Ok(v.to_be_bytes().to_vec()),
            (WireType::EnumU8, RegisterValue::U8(v)) => Ok(vec![*v]),
            (WireType::StringAscii, RegisterValue::Str(s)) => Ok(s.as_bytes().to_vec()),
            _ => Err(TerminalError::UnsupportedWireType(id)),
        }
    }

    /// Decode wire bytes per `wire_type`.
    pub fn decode(wire_type: WireType, data: &[u8], id: u32) -> Result<RegisterValue, TerminalError> {
        match wire_type {
            WireType::Float32Be => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| TerminalError::UnsupportedWireType(id))?;
                Ok(RegisterValue::F32(f32::from_be_bytes(bytes)))
            }
            WireType::Uint8 => data
                .first()
                .map(|&b| RegisterValue::U8(b))
                .ok_or(TerminalError::UnsupportedWireType(id)),
            WireType::Uint16Be => {
                let bytes: [u8; 2] = data
                    .try_into()
                    .map_err(|_| TerminalError::UnsupportedWireType(id))?;
                Ok(RegisterValue::U16(u16::from_be_bytes(bytes)))
            }
            WireType::Uint32Be => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| TerminalError::UnsupportedWireType(id))?;
                Ok(RegisterValue::U32(u32::from_be_bytes(bytes)))
            }
            WireType::EnumU8 => data
                .first()
                .map(|&b| RegisterValue::U8(b))
                .ok_or(TerminalError::UnsupportedWireType(id)),
            WireType::StringAscii => String::from_utf8(data.to_vec())
                .map(RegisterValue::Str)
                .map_err(|_| TerminalError::UnsupportedWireType(id)),
        }
    }
}

/// Static metadata for one register, supplied by the host application.
#[derive(Clone, Copy)]
pub struct RegisterDescriptor {
    pub id: u32,
    pub wire_type: WireType,
    pub writable: bool,
    pub label: &'static str,
    pub validate: Option<fn(&RegisterValue) -> bool>,
}

impl std::fmt::Debug for RegisterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterDescriptor")
            .field("id", &self.id)
            .field("wire_type", &self.wire_type)
            .field("writable", &self.writable)
            .field("label", &self.label)
            .finish()
    }
}

/// Lookup boundary the core calls into for register metadata. Hosts
/// implement this over whatever storage fits their catalog (a static
/// table, a database, a config file); [`StaticCatalog`] covers the common
/// case of a compile-time slice.
pub trait RegisterCatalog: Send + Sync {
    fn get(&self, id: u32) -> Option<&RegisterDescriptor>;
}

/// A [`RegisterCatalog`] backed by a `&'static` slice of descriptors.
pub struct StaticCatalog {
    descriptors: &'static [RegisterDescriptor],
}

impl StaticCatalog {
    pub const fn new(descriptors: &'static [RegisterDescriptor]) -> Self {
        Self { descriptors }
    }
}

impl RegisterCatalog for StaticCatalog {
    fn get(&self, id: u32) -> Option<&RegisterDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float32_round_trips_big_endian() {
        let bytes = RegisterValue::F32(3.5).encode(WireType::Float32Be, 1).unwrap();
        assert_eq!(bytes, 3.5f32.to_be_bytes().to_vec());
        let decoded = RegisterValue::decode(WireType::Float32Be, &bytes, 1).unwrap();
        assert_eq!(decoded, RegisterValue::F32(3.5));
    }

    #[test]
    fn uint16_round_trips_big_endian() {
        let bytes = RegisterValue::U16(0x1234).encode(WireType::Uint16Be, 1).unwrap();
        assert_eq!(bytes, vec![0x12, 0x34]);
        let decoded = RegisterValue::decode(WireType::Uint16Be, &bytes, 1).unwrap();
        assert_eq!(decoded, RegisterValue::U16(0x1234));
    }

    #[test]
    fn mismatched_value_and_wire_type_is_unsupported() {
        let err = RegisterValue::U8(1).encode(WireType::Float32Be, 7).unwrap_err();
        assert!(matches!(err, TerminalError::UnsupportedWireType(7)));
    }

    #[test]
    fn static_catalog_looks_up_by_id() {
        static REGS: &[RegisterDescriptor] = &[RegisterDescriptor {
            id: 0x400F015B,
            wire_type: WireType::Float32Be,
            writable: false,
            label: "solar_power",
            validate: None,
        }];
        let catalog = StaticCatalog::new(REGS);
        assert!(catalog.get(0x400F015B).is_some());
        assert!(catalog.get(0xDEAD).is_none());
    }
}
