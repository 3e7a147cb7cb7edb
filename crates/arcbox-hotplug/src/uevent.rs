//! Kernel and udev-monitor uevent codec.
//!
//! A uevent is a sequence of NUL-terminated `KEY=VALUE` records. Kernel
//! messages start with a summary line (`add@/devices/...`), udev-monitor
//! messages start with a fixed binary header:
//!
//! ```text
//! ┌──────────────┬───────┬─────────────┬────────────────┬────────────────┬──────────────┐
//! │ "libudev\0"  │ magic │ header_size │ properties_off │ properties_len │ 4 × filter   │
//! │   8 bytes    │  u32  │     u32     │      u32       │      u32       │  u32 words   │
//! └──────────────┴───────┴─────────────┴────────────────┴────────────────┴──────────────┘
//!                          all header words big-endian, 40 bytes total
//! ```
//!
//! [`UeventMessage`] owns its bytes. Parsed string fields are spans into the
//! buffer and are handed out as `&str` borrowed from the message, so a view
//! can never outlive the bytes it points into. Changing the length of a field
//! shifts every later offset, therefore [`UeventMessage::replace_field`]
//! builds a new buffer and decodes it from scratch instead of editing in
//! place.

use std::fmt;

use crate::error::{HotplugError, Result};

/// Maximum size of a single uevent message.
pub const UEVENT_BUFFER_SIZE: usize = 16 * 1024;

/// Leading tag of udev-monitor messages.
pub const UDEV_MONITOR_TAG: &[u8; 8] = b"libudev\0";

/// Magic number carried by udev-monitor messages.
pub const UDEV_MONITOR_MAGIC: u32 = 0xfeed_cafe;

/// Size of the udev-monitor binary header.
pub const UDEV_HEADER_LEN: usize = 40;

/// Minimum distance between `properties_off` and the end of the message.
const UDEV_MIN_PROPERTIES: usize = 32;

/// String fields extracted from a uevent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UeventField {
    /// `ACTION=`
    Action,
    /// `SUBSYSTEM=`
    Subsystem,
    /// `DEVPATH=`
    Devpath,
    /// `DEVNAME=`
    Devname,
    /// `DEVTYPE=`
    Devtype,
    /// `DRIVER=`
    Driver,
    /// `PRODUCT=`
    Product,
    /// `INTERFACE=`
    Interface,
    /// `SYNTH_UUID=`
    SynthUuid,
    /// `ID_SERIAL_SHORT=`
    IdSerialShort,
}

impl UeventField {
    const COUNT: usize = 10;

    /// All string fields, in index order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Action,
        Self::Subsystem,
        Self::Devpath,
        Self::Devname,
        Self::Devtype,
        Self::Driver,
        Self::Product,
        Self::Interface,
        Self::SynthUuid,
        Self::IdSerialShort,
    ];

    /// Record key, without the `=`.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Action => "ACTION",
            Self::Subsystem => "SUBSYSTEM",
            Self::Devpath => "DEVPATH",
            Self::Devname => "DEVNAME",
            Self::Devtype => "DEVTYPE",
            Self::Driver => "DRIVER",
            Self::Product => "PRODUCT",
            Self::Interface => "INTERFACE",
            Self::SynthUuid => "SYNTH_UUID",
            Self::IdSerialShort => "ID_SERIAL_SHORT",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for UeventField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Binary header of a udev-monitor message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdevHeader {
    /// Protocol magic, [`UDEV_MONITOR_MAGIC`] when valid.
    pub magic: u32,
    /// Header size known to the sender.
    pub header_size: u32,
    /// Offset of the property records.
    pub properties_off: u32,
    /// Length of the property records.
    pub properties_len: u32,
    /// Subsystem filter hash.
    pub filter_subsystem_hash: u32,
    /// Devtype filter hash.
    pub filter_devtype_hash: u32,
    /// Tag bloom filter, high word.
    pub filter_tag_bloom_hi: u32,
    /// Tag bloom filter, low word.
    pub filter_tag_bloom_lo: u32,
}

impl UdevHeader {
    /// Creates a header for a properties block placed right after it.
    #[must_use]
    pub const fn new(properties_len: u32) -> Self {
        Self {
            magic: UDEV_MONITOR_MAGIC,
            header_size: UDEV_HEADER_LEN as u32,
            properties_off: UDEV_HEADER_LEN as u32,
            properties_len,
            filter_subsystem_hash: 0,
            filter_devtype_hash: 0,
            filter_tag_bloom_hi: 0,
            filter_tag_bloom_lo: 0,
        }
    }

    /// Reads the header words following the tag. `buf` must hold at least
    /// [`UDEV_HEADER_LEN`] bytes.
    fn read(buf: &[u8]) -> Self {
        let word = |i: usize| {
            let off = UDEV_MONITOR_TAG.len() + i * 4;
            u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        };
        Self {
            magic: word(0),
            header_size: word(1),
            properties_off: word(2),
            properties_len: word(3),
            filter_subsystem_hash: word(4),
            filter_devtype_hash: word(5),
            filter_tag_bloom_hi: word(6),
            filter_tag_bloom_lo: word(7),
        }
    }

    /// Encodes the header including the tag.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; UDEV_HEADER_LEN] {
        let mut out = [0u8; UDEV_HEADER_LEN];
        out[..8].copy_from_slice(UDEV_MONITOR_TAG);
        let words = [
            self.magic,
            self.header_size,
            self.properties_off,
            self.properties_len,
            self.filter_subsystem_hash,
            self.filter_devtype_hash,
            self.filter_tag_bloom_hi,
            self.filter_tag_bloom_lo,
        ];
        for (i, w) in words.iter().enumerate() {
            let off = 8 + i * 4;
            out[off..off + 4].copy_from_slice(&w.to_be_bytes());
        }
        out
    }
}

/// Origin of a decoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Sent by the kernel; records follow the `action@devpath` line.
    Kernel,
    /// Sent by a udev daemon; records start at `properties_off`.
    Udev(UdevHeader),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    const fn len(self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldIndex {
    spans: [Option<Span>; UeventField::COUNT],
    major: i32,
    minor: i32,
    id_vendor_id: u16,
    id_model_id: u16,
}

impl Default for FieldIndex {
    fn default() -> Self {
        Self {
            spans: [None; UeventField::COUNT],
            major: -1,
            minor: -1,
            id_vendor_id: 0,
            id_model_id: 0,
        }
    }
}

impl FieldIndex {
    fn build(raw: &[u8], start: usize) -> Self {
        let mut index = Self::default();
        let mut cursor = start;

        while cursor < raw.len() {
            let end = raw[cursor..]
                .iter()
                .position(|&b| b == 0)
                .map_or(raw.len(), |p| cursor + p);
            if end == cursor {
                break;
            }
            index.record(&raw[cursor..end], cursor);
            cursor = end + 1;
        }

        index
    }

    fn record(&mut self, record: &[u8], offset: usize) {
        if let Some(v) = record.strip_prefix(b"MAJOR=") {
            self.major = parse_decimal(v).unwrap_or(-1);
        } else if let Some(v) = record.strip_prefix(b"MINOR=") {
            self.minor = parse_decimal(v).unwrap_or(-1);
        } else if let Some(v) = record.strip_prefix(b"ID_VENDOR_ID=") {
            self.id_vendor_id = parse_hex_u16(v).unwrap_or(0);
        } else if let Some(v) = record.strip_prefix(b"ID_MODEL_ID=") {
            self.id_model_id = parse_hex_u16(v).unwrap_or(0);
        } else {
            for field in UeventField::ALL {
                let key = field.key().as_bytes();
                if record.len() > key.len() && record.starts_with(key) && record[key.len()] == b'='
                {
                    let start = offset + key.len() + 1;
                    self.spans[field.index()] = Some(Span {
                        start,
                        end: offset + record.len(),
                    });
                    break;
                }
            }
        }
    }
}

/// A decoded uevent that owns its raw bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct UeventMessage {
    raw: Vec<u8>,
    kind: MessageKind,
    properties_start: usize,
    index: FieldIndex,
}

impl UeventMessage {
    /// Decodes a message read from a uevent netlink socket.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::MalformedHeader`] for udev-monitor messages
    /// with a bad magic or a truncated header, and
    /// [`HotplugError::UnrecognizedMessage`] for buffers that are neither
    /// kernel nor udev messages.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::from_vec(buf.to_vec())
    }

    /// Decodes an owned buffer without copying it.
    ///
    /// # Errors
    ///
    /// See [`UeventMessage::decode`].
    pub fn from_vec(raw: Vec<u8>) -> Result<Self> {
        if raw.len() > UEVENT_BUFFER_SIZE {
            return Err(HotplugError::MessageTooLarge {
                len: raw.len(),
                max: UEVENT_BUFFER_SIZE,
            });
        }

        let (kind, properties_start) = if raw.starts_with(UDEV_MONITOR_TAG) {
            if raw.len() < UDEV_HEADER_LEN {
                return Err(HotplugError::MalformedHeader(format!(
                    "truncated header ({} < {UDEV_HEADER_LEN} bytes)",
                    raw.len()
                )));
            }
            let header = UdevHeader::read(&raw);
            if header.magic != UDEV_MONITOR_MAGIC {
                return Err(HotplugError::MalformedHeader(format!(
                    "unrecognized message signature ({:#x} != {UDEV_MONITOR_MAGIC:#x})",
                    header.magic
                )));
            }
            let off = header.properties_off as usize;
            if off.saturating_add(UDEV_MIN_PROPERTIES) > raw.len() {
                return Err(HotplugError::MalformedHeader(format!(
                    "message smaller than expected ({} > {})",
                    off.saturating_add(UDEV_MIN_PROPERTIES),
                    raw.len()
                )));
            }
            (MessageKind::Udev(header), off)
        } else {
            let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            if !raw[..nul].contains(&b'@') {
                return Err(HotplugError::UnrecognizedMessage);
            }
            (MessageKind::Kernel, (nul + 1).min(raw.len()))
        };

        let index = FieldIndex::build(&raw, properties_start);
        Ok(Self {
            raw,
            kind,
            properties_start,
            index,
        })
    }

    /// Returns a copy of this message with `field` set to `value`.
    ///
    /// The record is rewritten in a new buffer, the udev `properties_len` is
    /// adjusted by the length delta and the result is decoded again.
    ///
    /// # Errors
    ///
    /// Fails if the field is absent, the value contains a NUL byte or the
    /// result would exceed [`UEVENT_BUFFER_SIZE`].
    pub fn replace_field(&self, field: UeventField, value: &str) -> Result<Self> {
        let span = self.index.spans[field.index()].ok_or(HotplugError::FieldAbsent(field.key()))?;
        if value.as_bytes().contains(&0) {
            return Err(HotplugError::InvalidReplacement(format!(
                "{field} value contains NUL"
            )));
        }

        let len = self.raw.len() - span.len() + value.len();
        if len > UEVENT_BUFFER_SIZE {
            return Err(HotplugError::MessageTooLarge {
                len,
                max: UEVENT_BUFFER_SIZE,
            });
        }

        let mut raw = Vec::with_capacity(len);
        raw.extend_from_slice(&self.raw[..span.start]);
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(&self.raw[span.end..]);

        if let MessageKind::Udev(mut header) = self.kind {
            if span.start < UDEV_HEADER_LEN {
                return Err(HotplugError::InvalidReplacement(format!(
                    "{field} overlaps the udev header"
                )));
            }
            header.properties_len = u32::try_from(value.len())
                .ok()
                .and_then(|n| header.properties_len.checked_add(n))
                .and_then(|n| n.checked_sub(u32::try_from(span.len()).ok()?))
                .ok_or_else(|| {
                    HotplugError::InvalidReplacement("properties_len out of range".to_string())
                })?;
            raw[..UDEV_HEADER_LEN].copy_from_slice(&header.to_bytes());
        }

        Self::from_vec(raw)
    }

    /// Raw message bytes, exactly as they would be sent on the wire.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Message length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns true for an empty buffer (never produced by `decode`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Message origin.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// udev header, for udev-monitor messages.
    #[must_use]
    pub const fn udev_header(&self) -> Option<&UdevHeader> {
        match &self.kind {
            MessageKind::Udev(header) => Some(header),
            MessageKind::Kernel => None,
        }
    }

    /// Returns true if this message came from the kernel.
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, MessageKind::Kernel)
    }

    /// The kernel `action@devpath` summary line.
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Kernel => {
                let end = self
                    .raw
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(self.raw.len());
                std::str::from_utf8(&self.raw[..end]).ok()
            }
            MessageKind::Udev(_) => None,
        }
    }

    /// Iterates over every `KEY=VALUE` record.
    pub fn records(&self) -> impl Iterator<Item = &str> {
        self.raw[self.properties_start..]
            .split(|&b| b == 0)
            .take_while(|r| !r.is_empty())
            .filter_map(|r| std::str::from_utf8(r).ok())
    }

    /// Value of a string field, empty when absent or not UTF-8.
    #[must_use]
    pub fn field(&self, field: UeventField) -> &str {
        self.index.spans[field.index()]
            .and_then(|s| std::str::from_utf8(&self.raw[s.start..s.end]).ok())
            .unwrap_or("")
    }

    /// Returns true if the field record is present.
    #[must_use]
    pub fn has_field(&self, field: UeventField) -> bool {
        self.index.spans[field.index()].is_some()
    }

    /// `ACTION`
    #[must_use]
    pub fn action(&self) -> &str {
        self.field(UeventField::Action)
    }

    /// `SUBSYSTEM`
    #[must_use]
    pub fn subsystem(&self) -> &str {
        self.field(UeventField::Subsystem)
    }

    /// `DEVPATH`
    #[must_use]
    pub fn devpath(&self) -> &str {
        self.field(UeventField::Devpath)
    }

    /// `DEVNAME`
    #[must_use]
    pub fn devname(&self) -> &str {
        self.field(UeventField::Devname)
    }

    /// `DEVTYPE`
    #[must_use]
    pub fn devtype(&self) -> &str {
        self.field(UeventField::Devtype)
    }

    /// `DRIVER`
    #[must_use]
    pub fn driver(&self) -> &str {
        self.field(UeventField::Driver)
    }

    /// `PRODUCT`
    #[must_use]
    pub fn product(&self) -> &str {
        self.field(UeventField::Product)
    }

    /// `INTERFACE`
    #[must_use]
    pub fn interface(&self) -> &str {
        self.field(UeventField::Interface)
    }

    /// `SYNTH_UUID`
    #[must_use]
    pub fn synth_uuid(&self) -> &str {
        self.field(UeventField::SynthUuid)
    }

    /// `ID_SERIAL_SHORT`
    #[must_use]
    pub fn id_serial_short(&self) -> &str {
        self.field(UeventField::IdSerialShort)
    }

    /// `MAJOR`, or -1.
    #[must_use]
    pub const fn major(&self) -> i32 {
        self.index.major
    }

    /// `MINOR`, or -1.
    #[must_use]
    pub const fn minor(&self) -> i32 {
        self.index.minor
    }

    /// `ID_VENDOR_ID`, or 0.
    #[must_use]
    pub const fn id_vendor_id(&self) -> u16 {
        self.index.id_vendor_id
    }

    /// `ID_MODEL_ID`, or 0.
    #[must_use]
    pub const fn id_model_id(&self) -> u16 {
        self.index.id_model_id
    }

    /// USB `(vendor, product)` of the event.
    ///
    /// Not every kernel event carries the `ID_*` records, so the composite
    /// `PRODUCT=vvvv/pppp/rev` record is consulted when both are zero.
    #[must_use]
    pub fn usb_ids(&self) -> (u16, u16) {
        self.explicit_usb_ids()
            .or_else(|| parse_product_ids(self.product()))
            .unwrap_or((0, 0))
    }

    fn explicit_usb_ids(&self) -> Option<(u16, u16)> {
        match (self.id_vendor_id(), self.id_model_id()) {
            (0, 0) => None,
            ids => Some(ids),
        }
    }
}

impl fmt::Debug for UeventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UeventMessage")
            .field("kind", &self.kind)
            .field("len", &self.raw.len())
            .field("action", &self.action())
            .field("subsystem", &self.subsystem())
            .field("devpath", &self.devpath())
            .field("devname", &self.devname())
            .field("devtype", &self.devtype())
            .field("major", &self.major())
            .field("minor", &self.minor())
            .field("interface", &self.interface())
            .finish_non_exhaustive()
    }
}

/// Parses the `vvvv/pppp/rev` value of a `PRODUCT` record.
#[must_use]
pub fn parse_product_ids(product: &str) -> Option<(u16, u16)> {
    let mut parts = product.split('/');
    let vendor = parse_hex_u16(parts.next()?.as_bytes())?;
    let model = parse_hex_u16(parts.next()?.as_bytes())?;
    Some((vendor, model))
}

fn parse_hex_u16(v: &[u8]) -> Option<u16> {
    let digits = v.iter().take_while(|b| b.is_ascii_hexdigit()).count();
    if digits == 0 {
        return None;
    }
    let s = std::str::from_utf8(&v[..digits]).ok()?;
    u16::from_str_radix(s, 16).ok()
}

fn parse_decimal(v: &[u8]) -> Option<i32> {
    let sign = usize::from(v.first() == Some(&b'-'));
    let digits = v[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    std::str::from_utf8(&v[..sign + digits]).ok()?.parse().ok()
}
