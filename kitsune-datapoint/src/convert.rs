//! Converters between datapoint frames and properties
//!
//! A [`DatapointTable`] maps datapoint ids to properties. It yields one inbound converter,
//! decoding the frames devices report, and one outbound converter, encoding set requests
//! into `dataRequest` commands.

use std::sync::{
    Arc,
    atomic::{AtomicU16, Ordering},
};

use bytes::Bytes;
use compact_str::CompactString;
use kitsune::{
    catalog::DeviceClass,
    converter::{
        ConvertError, InboundConverter, InboundMessage, InboundMeta, OutboundConverter, OutboundMeta,
        SetOutcome, WireOp, field,
    },
    options::{Options, calibrate_and_round},
};
use kitsune_common::{Lookup, Patch};
use serde_json::{Value, json};

use crate::{
    CLUSTER,
    frame::{self, Datapoint, DatapointValue},
    packed::{BreezeSpeed, Slot, SlotLayout},
};

const MESSAGE_TYPES: &[&str] = &[
    "commandDataResponse",
    "commandDataReport",
    "commandActiveStatusReport",
    "commandActiveStatusReportAlt",
];

/// How one datapoint's value maps to a property value
#[derive(Debug, Clone, PartialEq)]
pub enum ValueConverter {
    /// The datapoint value as is; byte payloads become arrays
    Raw,
    Boolean,
    /// Bool as `"ON"`/`"OFF"`
    OnOff,
    /// Int32 divided by the factor
    Scale(f64),
    /// Like [`Self::Scale`], then calibrated and rounded per the property's options
    Measurement(f64),
    /// Enum index to name
    Lookup(Vec<(u8, &'static str)>),
    /// Int32 holding a bit-packed breeze profile, as `{ speed1, time1, .., speed5, time5 }`
    Breeze,
}

impl ValueConverter {
    pub fn lookup<L: Lookup>() -> Self {
        ValueConverter::Lookup(L::ALL.iter().map(|v| (v.value() as u8, v.name())).collect())
    }

    pub fn to_property(
        &self,
        value: &DatapointValue,
        property: &str,
        options: &Options,
    ) -> Result<Value, ConvertError> {
        let invalid = || ConvertError::InvalidValue {
            key: property.into(),
            value: raw_value(value),
        };

        Ok(match (self, value) {
            (ValueConverter::Raw, value) => raw_value(value),
            (ValueConverter::Boolean, DatapointValue::Bool(v)) => Value::Bool(*v),
            (ValueConverter::OnOff, DatapointValue::Bool(v)) => json!(if *v { "ON" } else { "OFF" }),
            (ValueConverter::Scale(factor), DatapointValue::Int32(v)) => json!(f64::from(*v) / factor),
            (ValueConverter::Measurement(factor), DatapointValue::Int32(v)) => {
                json!(calibrate_and_round(f64::from(*v) / factor, options, property)?)
            }
            (ValueConverter::Lookup(table), DatapointValue::EnumIndex(index)) => table
                .iter()
                .find(|(i, _)| i == index)
                .map(|(_, name)| json!(name))
                .ok_or_else(invalid)?,
            (ValueConverter::Breeze, DatapointValue::Int32(v)) => decode_breeze(*v as u32),
            _ => return Err(invalid()),
        })
    }

    pub fn to_datapoint(&self, value: &Value, key: &str) -> Result<DatapointValue, ConvertError> {
        let invalid = || ConvertError::InvalidValue { key: key.into(), value: value.clone() };

        Ok(match self {
            ValueConverter::Raw => match value {
                Value::Bool(v) => DatapointValue::Bool(*v),
                Value::String(s) => DatapointValue::Str(s.as_str().into()),
                Value::Number(n) => {
                    let v = n.as_i64().and_then(|v| i32::try_from(v).ok()).ok_or_else(invalid)?;
                    DatapointValue::Int32(v)
                }
                Value::Array(_) => DatapointValue::Raw(byte_array(value).ok_or_else(invalid)?),
                Value::Null | Value::Object(_) => return Err(invalid()),
            },
            ValueConverter::Boolean => DatapointValue::Bool(value.as_bool().ok_or_else(invalid)?),
            ValueConverter::OnOff => match value.as_str() {
                Some("ON") => DatapointValue::Bool(true),
                Some("OFF") => DatapointValue::Bool(false),
                _ => return Err(invalid()),
            },
            ValueConverter::Scale(factor) | ValueConverter::Measurement(factor) => {
                let scaled = (value.as_f64().ok_or_else(invalid)? * factor).round();
                if !(f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&scaled) {
                    return Err(invalid());
                }
                DatapointValue::Int32(scaled as i32)
            }
            ValueConverter::Lookup(table) => {
                let name = value.as_str().ok_or_else(invalid)?;
                let (index, _) = table.iter().find(|(_, n)| *n == name).ok_or_else(invalid)?;
                DatapointValue::EnumIndex(*index)
            }
            ValueConverter::Breeze => {
                let slots = breeze_slots(value).ok_or_else(invalid)?;
                let packed = SlotLayout::BREEZE.encode(&slots).map_err(|error| {
                    tracing::debug!(key, %error, "breeze profile out of range");
                    invalid()
                })?;
                DatapointValue::Int32(packed as i32)
            }
        })
    }
}

/// Every slot of the layout; slots after the first "off" one are whatever the device sent
fn decode_breeze(packed: u32) -> Value {
    let mut profile = Patch::new();

    for (k, slot) in SlotLayout::BREEZE.decode(packed).into_iter().enumerate() {
        let speed = BreezeSpeed::from_value(slot.speed.into()).unwrap_or(BreezeSpeed::Off);
        profile.insert(format!("speed{}", k + 1), json!(speed));
        profile.insert(format!("time{}", k + 1), json!(slot.duration));
    }

    Value::Object(profile)
}

/// Slots up to the first "off" one. A missing speed is "off"; off slots may omit their time.
fn breeze_slots(value: &Value) -> Option<Vec<Slot>> {
    let profile = value.as_object()?;
    let mut slots = Vec::new();

    for k in 1..=SlotLayout::BREEZE.slots() {
        let speed = match profile.get(&format!("speed{k}")) {
            None => BreezeSpeed::Off,
            Some(speed) => BreezeSpeed::from_name(speed.as_str()?)?,
        };

        let duration = match profile.get(&format!("time{k}")) {
            None | Some(Value::Null) if speed == BreezeSpeed::Off => 0,
            time => u32::try_from(time?.as_u64()?).ok()?,
        };

        slots.push(Slot::new(speed.value() as u8, duration));
        if speed == BreezeSpeed::Off {
            break;
        }
    }

    Some(slots)
}

fn raw_value(value: &DatapointValue) -> Value {
    match value {
        DatapointValue::Raw(bytes) | DatapointValue::Bitmap(bytes) => bytes.to_vec().into(),
        DatapointValue::Bool(v) => (*v).into(),
        DatapointValue::Int32(v) => (*v).into(),
        DatapointValue::Str(s) => s.as_str().into(),
        DatapointValue::EnumIndex(v) => (*v).into(),
    }
}

/// A JSON array of bytes
fn byte_array(value: &Value) -> Option<Bytes> {
    value
        .as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatapointMapping {
    pub id: u8,
    pub property: CompactString,
    pub converter: ValueConverter,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatapointTable {
    mappings: Vec<DatapointMapping>,
}

impl DatapointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: u8, property: &str, converter: ValueConverter) -> Self {
        self.mappings.push(DatapointMapping {
            id,
            property: property.into(),
            converter,
        });
        self
    }

    pub fn by_id(&self, id: u8) -> Option<&DatapointMapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    pub fn by_property(&self, property: &str) -> Option<&DatapointMapping> {
        self.mappings.iter().find(|m| m.property == property)
    }

    pub fn into_converters(self) -> (DatapointsInbound, DatapointsOutbound) {
        let table = Arc::new(self);

        let inbound = DatapointsInbound {
            table: table.clone(),
            types: MESSAGE_TYPES.iter().map(|&ty| ty.into()).collect(),
        };

        let outbound = DatapointsOutbound {
            keys: table.mappings.iter().map(|m| m.property.clone()).collect(),
            table,
            sequence: AtomicU16::new(0),
        };

        (inbound, outbound)
    }

    /// Adds both converters of this table to a device class
    pub fn register(self, class: DeviceClass) -> DeviceClass {
        let (inbound, outbound) = self.into_converters();
        class.with_inbound(inbound).with_outbound(outbound)
    }
}

pub struct DatapointsInbound {
    table: Arc<DatapointTable>,
    types: Vec<CompactString>,
}

impl InboundConverter for DatapointsInbound {
    fn name(&self) -> &str {
        "datapoints"
    }

    fn cluster(&self) -> &str {
        CLUSTER
    }

    fn types(&self) -> &[CompactString] {
        &self.types
    }

    fn convert(
        &self,
        msg: &InboundMessage,
        meta: &mut InboundMeta<'_>,
    ) -> Result<Option<Patch>, ConvertError> {
        let data = field(msg, "datapoints")?;
        let data = byte_array(data).ok_or_else(|| ConvertError::InvalidValue {
            key: "datapoints".into(),
            value: data.clone(),
        })?;

        let mut patch = Patch::new();

        for Datapoint { id, value } in frame::decode(data).datapoints {
            let Some(mapping) = self.table.by_id(id) else {
                tracing::debug!(device = %meta.device, id, ?value, "ignoring unknown datapoint");
                continue;
            };

            match mapping.converter.to_property(&value, &mapping.property, meta.options) {
                Ok(value) => {
                    let property = meta.postfix_with_endpoint_name(&mapping.property, msg);
                    patch.insert(property.into_string(), value);
                }
                Err(error) => {
                    tracing::warn!(device = %meta.device, id, property = %mapping.property, %error, "datapoint conversion failed");
                }
            }
        }

        Ok((!patch.is_empty()).then_some(patch))
    }
}

pub struct DatapointsOutbound {
    table: Arc<DatapointTable>,
    keys: Vec<CompactString>,
    sequence: AtomicU16,
}

impl OutboundConverter for DatapointsOutbound {
    fn name(&self) -> &str {
        "datapoints"
    }

    fn keys(&self) -> &[CompactString] {
        &self.keys
    }

    fn convert_set(&self, value: &Value, meta: &OutboundMeta<'_>) -> Result<SetOutcome, ConvertError> {
        let mapping = self
            .table
            .by_property(meta.property)
            .ok_or_else(|| ConvertError::NotWritable(meta.key.into()))?;

        let datapoint = Datapoint::new(mapping.id, mapping.converter.to_datapoint(value, meta.key)?);
        let frames = frame::encode(&[datapoint]).map_err(|error| {
            tracing::debug!(key = meta.key, %error, "datapoint does not fit a frame");
            ConvertError::InvalidValue { key: meta.key.into(), value: value.clone() }
        })?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let op = WireOp::command(
            meta.target,
            CLUSTER,
            "dataRequest",
            json!({ "seq": sequence, "datapoints": frames.to_vec() }),
        );

        Ok(SetOutcome::new(vec![op]).with_state(Patch::from_iter([(meta.property.to_owned(), value.clone())])))
    }

    /// Devices answer a query with a report of every datapoint
    fn convert_get(&self, meta: &OutboundMeta<'_>) -> Result<Vec<WireOp>, ConvertError> {
        Ok(vec![WireOp::command(meta.target, CLUSTER, "dataQuery", json!({}))])
    }
}
