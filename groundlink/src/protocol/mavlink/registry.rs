//! Message registry: msgid to `crc_extra` and payload length bounds.

use std::borrow::Cow;
use std::collections::HashMap;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::crc::X25Crc;

/// Registry entry for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageInfo {
    /// Message id.
    pub msgid: u32,
    /// Message name, e.g. `HEARTBEAT`.
    pub name: Cow<'static, str>,
    /// Per-type CRC salt.
    pub crc_extra: u8,
    /// Payload length without extension fields.
    pub min_length: u8,
    /// Payload length with extension fields.
    pub max_length: u8,
}

impl MessageInfo {
    /// Whether `len` is an acceptable payload length.
    pub fn accepts_length(&self, len: u8) -> bool {
        (self.min_length..=self.max_length).contains(&len)
    }
}

/// `(msgid, name, crc_extra, min_length, max_length)` for common-dialect messages.
const COMMON_MESSAGES: &[(u32, &str, u8, u8, u8)] = &[
    (0, "HEARTBEAT", 50, 9, 9),
    (1, "SYS_STATUS", 124, 31, 43),
    (2, "SYSTEM_TIME", 137, 12, 12),
    (4, "PING", 237, 14, 14),
    (20, "PARAM_REQUEST_READ", 214, 20, 20),
    (21, "PARAM_REQUEST_LIST", 159, 2, 2),
    (22, "PARAM_VALUE", 220, 25, 25),
    (23, "PARAM_SET", 168, 23, 23),
    (24, "GPS_RAW_INT", 24, 30, 52),
    (30, "ATTITUDE", 39, 28, 28),
    (33, "GLOBAL_POSITION_INT", 104, 28, 28),
    (65, "RC_CHANNELS", 118, 42, 42),
    (66, "REQUEST_DATA_STREAM", 148, 6, 6),
    (69, "MANUAL_CONTROL", 243, 11, 30),
    (74, "VFR_HUD", 20, 20, 20),
    (76, "COMMAND_LONG", 152, 33, 33),
    (77, "COMMAND_ACK", 143, 3, 10),
    (148, "AUTOPILOT_VERSION", 178, 60, 78),
    (253, "STATUSTEXT", 83, 51, 54),
];

/// Well-known message ids.
pub mod ids {
    /// `HEARTBEAT`
    pub const HEARTBEAT: u32 = 0;
    /// `SYS_STATUS`
    pub const SYS_STATUS: u32 = 1;
    /// `PARAM_REQUEST_LIST`
    pub const PARAM_REQUEST_LIST: u32 = 21;
    /// `PARAM_VALUE`
    pub const PARAM_VALUE: u32 = 22;
    /// `ATTITUDE`
    pub const ATTITUDE: u32 = 30;
    /// `COMMAND_LONG`
    pub const COMMAND_LONG: u32 = 76;
    /// `COMMAND_ACK`
    pub const COMMAND_ACK: u32 = 77;
    /// `STATUSTEXT`
    pub const STATUSTEXT: u32 = 253;
}

/// Lookup table consulted by the stream parser.
///
/// Populated once per dialect before parsing starts.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    entries: HashMap<u32, MessageInfo>,
}

impl MessageRegistry {
    /// Empty registry. Every frame parsed against it is an unknown message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the common-dialect messages listed in [`ids`]
    /// and a few more (`PING`, `PARAM_*`, `GPS_RAW_INT`, `VFR_HUD`, ...).
    pub fn common() -> Self {
        let mut registry = Self::new();
        for &(msgid, name, crc_extra, min_length, max_length) in COMMON_MESSAGES {
            registry.insert(MessageInfo {
                msgid,
                name: Cow::Borrowed(name),
                crc_extra,
                min_length,
                max_length,
            });
        }
        registry
    }

    /// Add or replace an entry. Returns the previous entry for that msgid.
    pub fn insert(&mut self, info: MessageInfo) -> Option<MessageInfo> {
        self.entries.insert(info.msgid, info)
    }

    /// Compute an entry from a definition and add it.
    pub fn register(&mut self, definition: &MessageDefinition) -> Result<()> {
        let info = definition.to_info()?;
        debug!(
            "Registered {} (id {}, crc_extra {}, length {}..={})",
            info.name, info.msgid, info.crc_extra, info.min_length, info.max_length
        );
        self.insert(info);
        Ok(())
    }

    /// Look up a message id.
    pub fn get(&self, msgid: u32) -> Option<&MessageInfo> {
        self.entries.get(&msgid)
    }

    /// Look up by name.
    pub fn find_by_name(&self, name: &str) -> Option<&MessageInfo> {
        self.entries.values().find(|info| info.name == name)
    }

    /// Number of registered messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<MessageInfo> for MessageRegistry {
    fn from_iter<I: IntoIterator<Item = MessageInfo>>(iter: I) -> Self {
        let mut registry = Self::new();
        for info in iter {
            registry.insert(info);
        }
        registry
    }
}

/// One field of a message definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    /// Base type as written in the dialect, e.g. `uint16_t` or `char`.
    pub type_name: String,
    /// Field name.
    pub name: String,
    /// Element count for array fields.
    pub array_length: Option<u8>,
    /// Declared after the `<extensions/>` marker.
    pub extension: bool,
}

impl FieldDefinition {
    /// Parse a field from its dialect type, e.g. `("char[50]", "text")`.
    pub fn new(type_decl: &str, name: &str) -> Result<Self> {
        let (type_name, array_length) = match type_decl.split_once('[') {
            Some((base, rest)) => {
                let len = rest
                    .strip_suffix(']')
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| Error::Config(format!("bad array type '{type_decl}'")))?;
                (base, Some(len))
            },
            None => (type_decl, None),
        };

        let field = Self {
            type_name: type_name.to_string(),
            name: name.to_string(),
            array_length,
            extension: false,
        };
        field.primitive_size()?;
        Ok(field)
    }

    /// Mark this field as an extension field.
    #[must_use]
    pub fn extension(mut self) -> Self {
        self.extension = true;
        self
    }

    /// Type name as it enters the `crc_extra` hash.
    ///
    /// `uint8_t_mavlink_version` hashes as plain `uint8_t`.
    pub fn crc_type_name(&self) -> &str {
        self.type_name
            .strip_suffix("_mavlink_version")
            .unwrap_or(&self.type_name)
    }

    /// Size in bytes of one element.
    pub fn primitive_size(&self) -> Result<usize> {
        match self.crc_type_name() {
            "char" | "int8_t" | "uint8_t" => Ok(1),
            "int16_t" | "uint16_t" => Ok(2),
            "int32_t" | "uint32_t" | "float" => Ok(4),
            "int64_t" | "uint64_t" | "double" => Ok(8),
            other => Err(Error::Config(format!("unknown field type '{other}'"))),
        }
    }

    /// Size in bytes on the wire.
    pub fn wire_size(&self) -> Result<usize> {
        Ok(self.primitive_size()? * usize::from(self.array_length.unwrap_or(1)))
    }
}

/// Message definition used to derive a [`MessageInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDefinition {
    /// Message name.
    pub name: String,
    /// Message id.
    pub msgid: u32,
    /// Fields in declaration order, extensions last.
    pub fields: Vec<FieldDefinition>,
}

impl MessageDefinition {
    /// Definition with no fields.
    pub fn new(name: &str, msgid: u32) -> Self {
        Self {
            name: name.to_string(),
            msgid,
            fields: Vec::new(),
        }
    }

    /// Append a field.
    #[must_use]
    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Fields in wire order.
    ///
    /// Base fields are stable-sorted by descending element size; extension
    /// fields follow in declaration order.
    pub fn wire_order(&self) -> Result<Vec<&FieldDefinition>> {
        let mut base = Vec::new();
        let mut extensions = Vec::new();
        for field in &self.fields {
            let size = field.primitive_size()?;
            if field.extension {
                extensions.push(field);
            } else {
                base.push((size, field));
            }
        }
        base.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(base.into_iter().map(|(_, f)| f).chain(extensions).collect())
    }

    /// Per-type CRC salt.
    #[allow(clippy::cast_possible_truncation)]
    pub fn crc_extra(&self) -> Result<u8> {
        let mut crc = X25Crc::new();
        crc.accumulate_str(&self.name);
        crc.accumulate(b' ');
        for field in self.wire_order()?.into_iter().filter(|f| !f.extension) {
            crc.accumulate_str(field.crc_type_name());
            crc.accumulate(b' ');
            crc.accumulate_str(&field.name);
            crc.accumulate(b' ');
            if let Some(len) = field.array_length {
                crc.accumulate(len);
            }
        }
        let value = crc.value();
        Ok(((value & 0xFF) ^ (value >> 8)) as u8)
    }

    /// Payload length without extensions.
    pub fn min_length(&self) -> Result<u8> {
        self.sum_sizes(|f| !f.extension)
    }

    /// Payload length including extensions.
    pub fn max_length(&self) -> Result<u8> {
        self.sum_sizes(|_| true)
    }

    /// Registry entry for this definition.
    pub fn to_info(&self) -> Result<MessageInfo> {
        Ok(MessageInfo {
            msgid: self.msgid,
            name: Cow::Owned(self.name.clone()),
            crc_extra: self.crc_extra()?,
            min_length: self.min_length()?,
            max_length: self.max_length()?,
        })
    }

    fn sum_sizes(&self, include: impl Fn(&FieldDefinition) -> bool) -> Result<u8> {
        let mut total = 0usize;
        for field in self.fields.iter().filter(|f| include(f)) {
            total += field.wire_size()?;
        }
        u8::try_from(total).map_err(|_| {
            Error::Config(format!(
                "message {} payload of {total} bytes exceeds 255",
                self.name
            ))
        })
    }
}
