//! Declarative field bindings
//!
//! A device table holds an ordered list of [`DecoderBinding`]s. Each binding
//! claims the packets of one message type and turns them into compare-and-set
//! field updates. Two flavours exist: [`RecordBinding`] reads scalars at fixed
//! offsets of a byte record, [`MessageBinding`] parses a structured message
//! once and extracts fields through accessor closures bound at table
//! construction.

use crate::error::DecodeError;
use crate::field::{FieldStore, FieldValue};
use crate::throttle::UpdateTracker;
use ecoflow_protocol::Packet;
use std::time::Duration;

/// Post-extraction value transform
pub type Transform = fn(FieldValue) -> FieldValue;

/// Which packets a binding consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFilter {
    pub src: Option<u8>,
    pub cmd_set: u8,
    pub cmd_id: u8,
}

impl PacketFilter {
    #[must_use]
    pub fn new(cmd_set: u8, cmd_id: u8) -> Self {
        Self {
            src: None,
            cmd_set,
            cmd_id,
        }
    }

    /// Only accept packets from `src`
    #[must_use]
    pub fn from_src(mut self, src: u8) -> Self {
        self.src = Some(src);
        self
    }

    #[must_use]
    pub fn matches(&self, packet: &Packet) -> bool {
        self.src.map_or(true, |src| src == packet.src())
            && self.cmd_set == packet.cmd_set()
            && self.cmd_id == packet.cmd_id()
    }
}

/// Outcome of applying a binding to a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Processed,
    Throttled,
}

/// Message type to field-update mapping
pub trait DecoderBinding: Send + Sync {
    /// Name used for throttling and logs
    fn message_type(&self) -> &'static str;

    fn filter(&self) -> PacketFilter;

    /// Names of every field this binding can set
    fn field_names(&self) -> Vec<&'static str>;

    /// Decode `payload` and update `store`
    fn apply(
        &self,
        payload: &[u8],
        store: &mut FieldStore,
        tracker: &mut UpdateTracker,
    ) -> Result<Applied, DecodeError>;
}

/// Little-endian scalar encodings found in fixed-layout records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl Scalar {
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
        }
    }

    /// Read at the start of `bytes`, which must hold [`Scalar::width`] bytes
    fn read(self, bytes: &[u8]) -> FieldValue {
        let b2 = || [bytes[0], bytes[1]];
        let b4 = || [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Self::Bool => FieldValue::Bool(bytes[0] != 0),
            Self::U8 => bytes[0].into(),
            Self::I8 => i8::from_le_bytes([bytes[0]]).into(),
            Self::U16 => u16::from_le_bytes(b2()).into(),
            Self::I16 => i16::from_le_bytes(b2()).into(),
            Self::U32 => u32::from_le_bytes(b4()).into(),
            Self::I32 => i32::from_le_bytes(b4()).into(),
            Self::F32 => f32::from_le_bytes(b4()).into(),
        }
    }
}

struct RecordField {
    name: &'static str,
    offset: usize,
    scalar: Scalar,
    transform: Option<Transform>,
}

/// Fields at fixed offsets of a byte record
pub struct RecordBinding {
    message_type: &'static str,
    filter: PacketFilter,
    fields: Vec<RecordField>,
    period: Option<Duration>,
}

impl RecordBinding {
    #[must_use]
    pub fn new(message_type: &'static str, filter: PacketFilter) -> Self {
        Self {
            message_type,
            filter,
            fields: Vec::new(),
            period: None,
        }
    }

    #[must_use]
    pub fn field(self, name: &'static str, offset: usize, scalar: Scalar) -> Self {
        self.push(name, offset, scalar, None)
    }

    #[must_use]
    pub fn field_with(
        self,
        name: &'static str,
        offset: usize,
        scalar: Scalar,
        transform: Transform,
    ) -> Self {
        self.push(name, offset, scalar, Some(transform))
    }

    /// Process at most one record per `period`
    #[must_use]
    pub fn throttle(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    fn push(
        mut self,
        name: &'static str,
        offset: usize,
        scalar: Scalar,
        transform: Option<Transform>,
    ) -> Self {
        self.fields.push(RecordField {
            name,
            offset,
            scalar,
            transform,
        });
        self
    }

    /// Smallest record holding every bound field
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.offset + f.scalar.width())
            .max()
            .unwrap_or(0)
    }
}

impl DecoderBinding for RecordBinding {
    fn message_type(&self) -> &'static str {
        self.message_type
    }

    fn filter(&self) -> PacketFilter {
        self.filter
    }

    fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    fn apply(
        &self,
        payload: &[u8],
        store: &mut FieldStore,
        tracker: &mut UpdateTracker,
    ) -> Result<Applied, DecodeError> {
        let needed = self.record_size();
        if payload.len() < needed {
            return Err(DecodeError::RecordTooShort {
                message: self.message_type,
                needed,
                len: payload.len(),
            });
        }
        if let Some(period) = self.period {
            if !tracker.accept(self.message_type, period, &[]) {
                return Ok(Applied::Throttled);
            }
        }

        for field in &self.fields {
            let raw = field.scalar.read(&payload[field.offset..]);
            let value = match field.transform {
                Some(transform) => transform(raw),
                None => raw,
            };
            store.set(field.name, value);
        }
        Ok(Applied::Processed)
    }
}

type Extract<M> = Box<dyn Fn(&M) -> Option<FieldValue> + Send + Sync>;

struct MessageField<M> {
    name: &'static str,
    extract: Extract<M>,
    transform: Option<Transform>,
}

struct Discriminator<M> {
    name: &'static str,
    present: fn(&M) -> bool,
}

/// Fields extracted from a structured message type `M`
///
/// Extractors return `None` when their source sub-message is absent, which
/// leaves the field untouched rather than resetting it.
pub struct MessageBinding<M> {
    message_type: &'static str,
    filter: PacketFilter,
    parse: fn(&[u8]) -> Result<M, DecodeError>,
    fields: Vec<MessageField<M>>,
    period: Option<Duration>,
    discriminators: Vec<Discriminator<M>>,
}

impl<M: 'static> MessageBinding<M> {
    #[must_use]
    pub fn new(
        message_type: &'static str,
        filter: PacketFilter,
        parse: fn(&[u8]) -> Result<M, DecodeError>,
    ) -> Self {
        Self {
            message_type,
            filter,
            parse,
            fields: Vec::new(),
            period: None,
            discriminators: Vec::new(),
        }
    }

    /// Bind a field to an accessor path into `M`
    #[must_use]
    pub fn field<F>(self, name: &'static str, extract: F) -> Self
    where
        F: Fn(&M) -> Option<FieldValue> + Send + Sync + 'static,
    {
        self.push(name, Box::new(extract), None)
    }

    #[must_use]
    pub fn field_with<F>(self, name: &'static str, extract: F, transform: Transform) -> Self
    where
        F: Fn(&M) -> Option<FieldValue> + Send + Sync + 'static,
    {
        self.push(name, Box::new(extract), Some(transform))
    }

    #[must_use]
    pub fn throttle(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Throttle the sub-message detected by `present` on its own timer
    #[must_use]
    pub fn discriminator(mut self, name: &'static str, present: fn(&M) -> bool) -> Self {
        self.discriminators.push(Discriminator { name, present });
        self
    }

    fn push(mut self, name: &'static str, extract: Extract<M>, transform: Option<Transform>) -> Self {
        self.fields.push(MessageField {
            name,
            extract,
            transform,
        });
        self
    }
}

impl<M: 'static> DecoderBinding for MessageBinding<M> {
    fn message_type(&self) -> &'static str {
        self.message_type
    }

    fn filter(&self) -> PacketFilter {
        self.filter
    }

    fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    fn apply(
        &self,
        payload: &[u8],
        store: &mut FieldStore,
        tracker: &mut UpdateTracker,
    ) -> Result<Applied, DecodeError> {
        let message = (self.parse)(payload)?;

        if let Some(period) = self.period {
            let present: Vec<&'static str> = self
                .discriminators
                .iter()
                .filter(|d| (d.present)(&message))
                .map(|d| d.name)
                .collect();
            if !tracker.accept(self.message_type, period, &present) {
                return Ok(Applied::Throttled);
            }
        }

        for field in &self.fields {
            let Some(raw) = (field.extract)(&message) else {
                continue;
            };
            let value = match field.transform {
                Some(transform) => transform(raw),
                None => raw,
            };
            store.set(field.name, value);
        }
        Ok(Applied::Processed)
    }
}
