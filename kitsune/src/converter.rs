//! Converter contracts
//!
//! Inbound converters turn wire messages into state patches; outbound converters turn set
//! and get requests into wire operations. Both are plain synchronous functions of their
//! input and a metadata view: I/O a converter wants performed is returned to the dispatcher
//! (as wire ops, replies or scheduled actions), which runs it under the entity's ordering
//! guarantee.

use core::time::Duration;

use compact_str::{CompactString, format_compact};
use kitsune_common::{DeviceId, Entity, Patch, expose::Expose};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    catalog::DeviceClass,
    endpoint::EndpointError,
    options::{Options, OptionsError},
    store::EntityStateStore,
};

/// A message received from a device
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Endpoint (or device) the message came from
    pub endpoint: Entity,
    pub cluster: CompactString,
    /// Message type, e.g. `attributeReport` or `commandDataReport`
    pub kind: CompactString,
    pub data: Value,
    /// Group the message was addressed to, for multicast commands
    pub group: Option<u16>,
    pub linkquality: Option<u8>,
    pub transaction_sequence: Option<u8>,
}

impl InboundMessage {
    pub fn new(endpoint: Entity, cluster: &str, kind: &str, data: Value) -> Self {
        Self {
            endpoint,
            cluster: cluster.into(),
            kind: kind.into(),
            data,
            group: None,
            linkquality: None,
            transaction_sequence: None,
        }
    }

    pub fn with_linkquality(mut self, linkquality: u8) -> Self {
        self.linkquality = Some(linkquality);
        self
    }

    pub fn with_transaction_sequence(mut self, sequence: u8) -> Self {
        self.transaction_sequence = Some(sequence);
        self
    }

    pub fn with_group(mut self, group: u16) -> Self {
        self.group = Some(group);
        self
    }
}

/// Attribute reporting configuration for one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reporting {
    pub attribute: CompactString,
    pub min_interval: u16,
    pub max_interval: u16,
    pub reportable_change: Value,
}

/// A single operation to perform on the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireOp {
    Read {
        target: Entity,
        cluster: CompactString,
        attributes: Vec<CompactString>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manufacturer_code: Option<u16>,
    },
    Write {
        target: Entity,
        cluster: CompactString,
        attributes: Patch,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manufacturer_code: Option<u16>,
    },
    Command {
        target: Entity,
        cluster: CompactString,
        command: CompactString,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manufacturer_code: Option<u16>,
    },
    Bind {
        target: Entity,
        cluster: CompactString,
        destination: Entity,
    },
    ConfigureReporting {
        target: Entity,
        cluster: CompactString,
        reporting: Vec<Reporting>,
    },
}

impl WireOp {
    pub fn read<S: Into<CompactString>>(
        target: &Entity,
        cluster: &str,
        attributes: impl IntoIterator<Item = S>,
    ) -> Self {
        WireOp::Read {
            target: target.clone(),
            cluster: cluster.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
            manufacturer_code: None,
        }
    }

    pub fn write(target: &Entity, cluster: &str, attributes: Patch) -> Self {
        WireOp::Write {
            target: target.clone(),
            cluster: cluster.into(),
            attributes,
            manufacturer_code: None,
        }
    }

    pub fn command(target: &Entity, cluster: &str, command: &str, payload: Value) -> Self {
        WireOp::Command {
            target: target.clone(),
            cluster: cluster.into(),
            command: command.into(),
            payload,
            manufacturer_code: None,
        }
    }

    pub fn with_manufacturer_code(mut self, code: u16) -> Self {
        match &mut self {
            WireOp::Read { manufacturer_code, .. }
            | WireOp::Write { manufacturer_code, .. }
            | WireOp::Command { manufacturer_code, .. } => *manufacturer_code = Some(code),
            WireOp::Bind { .. } | WireOp::ConfigureReporting { .. } => {}
        }
        self
    }

    pub fn target(&self) -> &Entity {
        match self {
            WireOp::Read { target, .. }
            | WireOp::Write { target, .. }
            | WireOp::Command { target, .. }
            | WireOp::Bind { target, .. }
            | WireOp::ConfigureReporting { target, .. } => target,
        }
    }

    pub fn cluster(&self) -> &str {
        match self {
            WireOp::Read { cluster, .. }
            | WireOp::Write { cluster, .. }
            | WireOp::Command { cluster, .. }
            | WireOp::Bind { cluster, .. }
            | WireOp::ConfigureReporting { cluster, .. } => cluster,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: CompactString, value: Value },
    #[error("message is missing {0:?}")]
    MissingField(CompactString),
    #[error("{0} cannot be set")]
    NotWritable(CompactString),
    #[error("{0} cannot be read")]
    NotReadable(CompactString),
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("{0}")]
    Other(String),
}

/// What a scheduled timer does when it fires
#[derive(Debug, Clone, PartialEq)]
pub enum TimerAction {
    /// Publish a patch into the state of the timer entity's owner
    Publish(Patch),
    Execute(Vec<WireOp>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub entity: Entity,
    pub key: CompactString,
    pub delay: Duration,
    pub action: TimerAction,
}

/// Everything an inbound converter may look at or touch
pub struct InboundMeta<'a> {
    pub device: &'a DeviceId,
    pub class: &'a DeviceClass,
    pub options: &'a Options,
    /// Last published state of the message's owner
    pub state: &'a Patch,
    pub store: &'a mut EntityStateStore,
    replies: Vec<WireOp>,
    scheduled: Vec<Scheduled>,
}

impl<'a> InboundMeta<'a> {
    pub fn new(
        device: &'a DeviceId,
        class: &'a DeviceClass,
        options: &'a Options,
        state: &'a Patch,
        store: &'a mut EntityStateStore,
    ) -> Self {
        Self {
            device,
            class,
            options,
            state,
            store,
            replies: vec![],
            scheduled: vec![],
        }
    }

    /// Queues a wire operation to run before the dispatch of this message completes
    pub fn reply(&mut self, op: WireOp) {
        self.replies.push(op);
    }

    /// Arms an entity-scoped timer once the converter returns. A timer already armed under
    /// the same entity and key is cancelled.
    pub fn schedule(&mut self, entity: &Entity, key: &str, delay: Duration, action: TimerAction) {
        self.scheduled.push(Scheduled {
            entity: entity.clone(),
            key: key.into(),
            delay,
            action,
        });
    }

    /// `action` → `action_left` for multi-endpoint classes
    pub fn postfix_with_endpoint_name(&self, property: &str, msg: &InboundMessage) -> CompactString {
        let meta = &self.class.meta;

        if meta.multi_endpoint
            && !meta.multi_endpoint_skip.iter().any(|skip| skip == property)
            && let Some(endpoint) = msg.endpoint.endpoint_id()
            && let Some(suffix) = self.class.endpoints.suffix_for(endpoint)
        {
            return format_compact!("{property}_{suffix}");
        }

        property.into()
    }

    pub fn into_effects(self) -> (Vec<WireOp>, Vec<Scheduled>) {
        (self.replies, self.scheduled)
    }
}

/// Everything an outbound converter may look at for one key of a request
#[derive(Debug, Clone, Copy)]
pub struct OutboundMeta<'a> {
    /// The key as requested, e.g. `state_left`
    pub key: &'a str,
    /// The key with its endpoint suffix removed, e.g. `state`
    pub property: &'a str,
    pub endpoint_name: Option<&'a str>,
    /// Endpoint or group the key resolved to
    pub target: &'a Entity,
    pub options: &'a Options,
    pub state: &'a Patch,
    /// The whole request the key is part of
    pub message: &'a Patch,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOutcome {
    pub ops: Vec<WireOp>,
    /// Optimistic state, published as soon as `ops` succeed
    pub state: Option<Patch>,
}

impl SetOutcome {
    pub fn new(ops: Vec<WireOp>) -> Self {
        Self { ops, state: None }
    }

    pub fn with_state(mut self, state: Patch) -> Self {
        self.state = Some(state);
        self
    }
}

pub trait InboundConverter: Send + Sync {
    fn name(&self) -> &str;
    fn cluster(&self) -> &str;
    fn types(&self) -> &[CompactString];

    fn matches(&self, msg: &InboundMessage) -> bool {
        msg.cluster == self.cluster() && self.types().iter().any(|ty| *ty == msg.kind)
    }

    /// User options this converter understands
    fn options(&self) -> Vec<Expose> {
        vec![]
    }

    fn convert(
        &self,
        msg: &InboundMessage,
        meta: &mut InboundMeta<'_>,
    ) -> Result<Option<Patch>, ConvertError>;
}

pub trait OutboundConverter: Send + Sync {
    fn name(&self) -> &str;
    fn keys(&self) -> &[CompactString];

    fn claims(&self, property: &str) -> bool {
        self.keys().iter().any(|key| key == property)
    }

    fn options(&self) -> Vec<Expose> {
        vec![]
    }

    fn convert_set(&self, value: &Value, meta: &OutboundMeta<'_>) -> Result<SetOutcome, ConvertError>;

    fn convert_get(&self, meta: &OutboundMeta<'_>) -> Result<Vec<WireOp>, ConvertError> {
        Err(ConvertError::NotReadable(meta.key.into()))
    }
}

type InboundFn =
    dyn Fn(&InboundMessage, &mut InboundMeta<'_>) -> Result<Option<Patch>, ConvertError> + Send + Sync;
type SetFn = dyn Fn(&Value, &OutboundMeta<'_>) -> Result<SetOutcome, ConvertError> + Send + Sync;
type GetFn = dyn Fn(&OutboundMeta<'_>) -> Result<Vec<WireOp>, ConvertError> + Send + Sync;

/// An inbound converter made of a closure
pub struct Inbound {
    name: CompactString,
    cluster: CompactString,
    types: Vec<CompactString>,
    options: Vec<Expose>,
    convert: Box<InboundFn>,
}

impl Inbound {
    pub fn new(
        name: &str,
        cluster: &str,
        types: &[&str],
        convert: impl Fn(&InboundMessage, &mut InboundMeta<'_>) -> Result<Option<Patch>, ConvertError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            cluster: cluster.into(),
            types: types.iter().map(|&ty| ty.into()).collect(),
            options: vec![],
            convert: Box::new(convert),
        }
    }

    pub fn with_option(mut self, option: Expose) -> Self {
        self.options.push(option);
        self
    }
}

impl InboundConverter for Inbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn types(&self) -> &[CompactString] {
        &self.types
    }

    fn options(&self) -> Vec<Expose> {
        self.options.clone()
    }

    fn convert(
        &self,
        msg: &InboundMessage,
        meta: &mut InboundMeta<'_>,
    ) -> Result<Option<Patch>, ConvertError> {
        (self.convert)(msg, meta)
    }
}

/// An outbound converter made of closures
pub struct Outbound {
    name: CompactString,
    keys: Vec<CompactString>,
    options: Vec<Expose>,
    set: Option<Box<SetFn>>,
    get: Option<Box<GetFn>>,
}

impl Outbound {
    pub fn new(name: &str, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            keys: keys.iter().map(|&key| key.into()).collect(),
            options: vec![],
            set: None,
            get: None,
        }
    }

    pub fn with_set(
        mut self,
        set: impl Fn(&Value, &OutboundMeta<'_>) -> Result<SetOutcome, ConvertError> + Send + Sync + 'static,
    ) -> Self {
        self.set = Some(Box::new(set));
        self
    }

    pub fn with_get(
        mut self,
        get: impl Fn(&OutboundMeta<'_>) -> Result<Vec<WireOp>, ConvertError> + Send + Sync + 'static,
    ) -> Self {
        self.get = Some(Box::new(get));
        self
    }

    pub fn with_option(mut self, option: Expose) -> Self {
        self.options.push(option);
        self
    }
}

impl OutboundConverter for Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn keys(&self) -> &[CompactString] {
        &self.keys
    }

    fn options(&self) -> Vec<Expose> {
        self.options.clone()
    }

    fn convert_set(&self, value: &Value, meta: &OutboundMeta<'_>) -> Result<SetOutcome, ConvertError> {
        match &self.set {
            Some(set) => set(value, meta),
            None => Err(ConvertError::NotWritable(meta.key.into())),
        }
    }

    fn convert_get(&self, meta: &OutboundMeta<'_>) -> Result<Vec<WireOp>, ConvertError> {
        match &self.get {
            Some(get) => get(meta),
            None => Err(ConvertError::NotReadable(meta.key.into())),
        }
    }
}

/// Reads a field of an inbound message's data
pub fn field<'a>(msg: &'a InboundMessage, name: &str) -> Result<&'a Value, ConvertError> {
    msg.data
        .get(name)
        .ok_or_else(|| ConvertError::MissingField(name.into()))
}
