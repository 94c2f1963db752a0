//! Routing between the wire and the converters
//!
//! Inbound messages go to every matching inbound converter of the device's class; set and
//! get requests are split per key and routed to the first outbound converter claiming it.
//! Work for one entity is processed strictly in arrival order, including the wire I/O it
//! causes: each dispatch key (the owning device, or the group) has a FIFO lock that is held
//! for the whole dispatch.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use compact_str::{CompactString, format_compact};
use kitsune_common::{
    Access, DeviceId, Entity, EntityKey, Patch,
    expose::{Expose, ExposeError, find_property},
    merge_patch,
};
use serde_json::Value;

use crate::{
    Error, Result,
    catalog::{DeviceClass, DeviceShape},
    converter::{
        ConvertError, InboundMessage, InboundMeta, OutboundConverter, OutboundMeta, Scheduled,
        TimerAction,
    },
    options::{Options, merge_options},
    publish::StateSink,
    store::EntityStateStore,
    transport::{Transport, TransportError},
};

/// Sequence numbers remembered per device for de-duplication
const TRANSACTION_WINDOW: usize = 5;

/// Runtime state shared by everything that converts
#[derive(Debug, Default)]
pub struct Context {
    store: Mutex<EntityStateStore>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store<R>(&self, f: impl FnOnce(&mut EntityStateStore) -> R) -> R {
        f(&mut self.store.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KeyFailure {
    #[error("no converter supports {key:?}")]
    UnsupportedKey { key: CompactString },
    #[error("{key:?} does not allow {operation}")]
    AccessDenied { key: CompactString, operation: &'static str },
    #[error("{key}: {source}")]
    Convert { key: CompactString, source: ConvertError },
    #[error("{key}: {source}")]
    Transport { key: CompactString, source: TransportError },
}

impl KeyFailure {
    pub fn key(&self) -> &str {
        match self {
            KeyFailure::UnsupportedKey { key }
            | KeyFailure::AccessDenied { key, .. }
            | KeyFailure::Convert { key, .. }
            | KeyFailure::Transport { key, .. } => key,
        }
    }
}

/// Outcome of a request where some keys failed; the others were still executed
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{} of {} keys failed", .failures.len(), .failures.len() + .succeeded.len())]
pub struct MultiError {
    pub failures: Vec<KeyFailure>,
    pub succeeded: Vec<CompactString>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConverterFailure {
    #[error("{converter}: {source}")]
    Convert { converter: CompactString, source: ConvertError },
    #[error("{converter}: reply failed: {source}")]
    Reply { converter: CompactString, source: TransportError },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundReport {
    /// What was published, empty if nothing was
    pub patch: Patch,
    pub failures: Vec<ConverterFailure>,
    /// The message repeated a recently seen transaction and was dropped
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetReport {
    pub applied: Vec<CompactString>,
    /// Optimistic state published for the applied keys
    pub state: Patch,
}

struct Device {
    shape: DeviceShape,
    class: Arc<DeviceClass>,
    options: Options,
    exposes: Vec<Expose>,
}

struct Route<'a> {
    converter: &'a dyn OutboundConverter,
    property: &'a str,
    endpoint_name: Option<&'a str>,
    target: Entity,
}

type Queue = Arc<tokio::sync::Mutex<()>>;

pub struct Dispatcher {
    ctx: Arc<Context>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn StateSink>,
    devices: RwLock<HashMap<DeviceId, Arc<Device>>>,
    groups: RwLock<HashMap<u16, Vec<DeviceId>>>,
    queues: Mutex<HashMap<EntityKey, Queue>>,
    transactions: Mutex<HashMap<DeviceId, VecDeque<u8>>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>, transport: Arc<dyn Transport>, sink: Arc<dyn StateSink>) -> Self {
        Self {
            ctx,
            transport,
            sink,
            devices: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Builds and validates the device's expose tree and starts dispatching for it.
    ///
    /// Re-interviewing a known device replaces its class and options; runtime state is kept.
    pub fn interview(
        &self,
        shape: DeviceShape,
        class: Arc<DeviceClass>,
        user_options: &Options,
    ) -> Result<Vec<Expose>> {
        let options = merge_options([&class.defaults, &class.meta.options, user_options]);
        let exposes = class.build_exposes(&shape, &options);

        for expose in &exposes {
            expose.validate()?;

            for node in expose.properties() {
                if node.access.contains(Access::SET) && class.outbound_for(base_property(node)).is_none() {
                    return Err(ExposeError::Unclaimed {
                        property: node.property.clone().unwrap_or_else(|| node.name.clone()),
                    }
                    .into());
                }
            }
        }

        tracing::info!(device = %shape.ieee, model = %class.model, exposes = exposes.len(), "device interviewed");

        let device = Device {
            shape,
            class,
            options,
            exposes: exposes.clone(),
        };

        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.shape.ieee.clone(), Arc::new(device));

        Ok(exposes)
    }

    pub fn exposes(&self, id: &DeviceId) -> Result<Vec<Expose>> {
        Ok(self.device(id)?.exposes.clone())
    }

    pub fn options(&self, id: &DeviceId) -> Result<Options> {
        Ok(self.device(id)?.options.clone())
    }

    /// Runs the class's configure routine (bindings, reporting) against the device
    pub async fn configure(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        let queue = self.queue(&Entity::device(id.clone()));
        let _guard = queue.lock().await;

        for op in device.class.configure_ops(&device.shape) {
            self.transport.execute(&op).await?;
        }

        tracing::info!(device = %id, model = %device.class.model, "device configured");
        Ok(())
    }

    pub fn add_group(&self, group: u16, members: impl IntoIterator<Item = DeviceId>) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group, members.into_iter().collect());
    }

    pub fn remove_group(&self, group: u16) -> bool {
        let removed = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group)
            .is_some();

        self.ctx.with_store(|store| store.clear_entity(&Entity::group(group)));
        removed
    }

    /// Forgets a device along with all runtime state of it and its endpoints
    pub fn remove_device(&self, id: &DeviceId) -> bool {
        let removed = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();

        self.ctx.with_store(|store| store.clear_device(id));

        for members in self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
        {
            members.retain(|member| member != id);
        }

        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        if removed {
            tracing::info!(device = %id, "device removed");
        }

        removed
    }

    /// Cancels every outstanding timer; returns how many were pending
    pub fn stop(&self) -> usize {
        let cancelled = self.ctx.with_store(EntityStateStore::stop_all);
        tracing::info!(cancelled, "dispatcher stopped");
        cancelled
    }

    pub async fn handle_inbound(&self, msg: InboundMessage) -> Result<InboundReport> {
        let Some(id) = msg.endpoint.device_id().cloned() else {
            return Err(Error::NotADevice(msg.endpoint.clone()));
        };

        let device = self.device(&id)?;
        let owner = msg.endpoint.owner();
        let queue = self.queue(&owner);
        let _guard = queue.lock().await;

        if let Some(sequence) = msg.transaction_sequence
            && !device.class.meta.publish_duplicate_transaction
            && self.seen_transaction(&id, sequence)
        {
            tracing::debug!(device = %id, sequence, cluster = %msg.cluster, "dropping duplicate transaction");
            return Ok(InboundReport {
                duplicate: true,
                ..Default::default()
            });
        }

        let state = self.sink.state(&owner).await;
        let mut report = InboundReport::default();

        for converter in device.class.inbound.iter().filter(|c| c.matches(&msg)) {
            let (result, replies, scheduled) = self.ctx.with_store(|store| {
                let mut meta = InboundMeta::new(&id, &device.class, &device.options, &state, store);
                let result = converter.convert(&msg, &mut meta);
                let (replies, scheduled) = meta.into_effects();
                (result, replies, scheduled)
            });

            match result {
                Ok(Some(patch)) => merge_patch(&mut report.patch, patch),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(device = %id, converter = converter.name(), %error, "inbound conversion failed");
                    report.failures.push(ConverterFailure::Convert {
                        converter: converter.name().into(),
                        source: error,
                    });
                    continue;
                }
            }

            for op in &replies {
                if let Err(error) = self.transport.execute(op).await {
                    tracing::warn!(device = %id, converter = converter.name(), %error, "reply failed");
                    report.failures.push(ConverterFailure::Reply {
                        converter: converter.name().into(),
                        source: error,
                    });
                }
            }

            for scheduled in scheduled {
                self.arm(scheduled, queue.clone());
            }
        }

        if !report.patch.is_empty() {
            if let Some(linkquality) = msg.linkquality {
                report.patch.insert("linkquality".to_owned(), linkquality.into());
            }

            self.sink.publish(&owner, report.patch.clone()).await;
        }

        Ok(report)
    }

    /// Sets every key of `request` independently. Keys that fail don't stop the others; their
    /// failures are collected into [`Error::Partial`].
    pub async fn set(&self, target: &Entity, request: Patch) -> Result<SetReport> {
        let device = self.device_for(target)?;
        let owner = target.owner();
        let queue = self.queue(&owner);
        let _guard = queue.lock().await;

        let state = self.sink.state(&owner).await;
        let mut report = SetReport::default();
        let mut failures = vec![];

        for (key, value) in &request {
            match self.set_key(&device, target, key, value, &state, &request).await {
                Ok(patch) => {
                    if let Some(patch) = patch {
                        merge_patch(&mut report.state, patch);
                    }
                    report.applied.push(key.as_str().into());
                }
                Err(failure) => {
                    tracing::warn!(%target, key, %failure, "set failed");
                    failures.push(failure);
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(MultiError { failures, succeeded: report.applied }.into())
        }
    }

    /// [`Self::set`] for requests that arrive as JSON
    pub async fn set_value(&self, target: &Entity, request: Value) -> Result<SetReport> {
        let request = serde_json::from_value::<Patch>(request)?;
        self.set(target, request).await
    }

    /// Queries every key; answers arrive later as inbound messages
    pub async fn get(&self, target: &Entity, keys: &[&str]) -> Result<Vec<CompactString>> {
        let device = self.device_for(target)?;
        let owner = target.owner();
        let queue = self.queue(&owner);
        let _guard = queue.lock().await;

        let state = self.sink.state(&owner).await;
        let message = keys
            .iter()
            .map(|&key| (key.to_owned(), Value::String(String::new())))
            .collect::<Patch>();

        let mut succeeded = vec![];
        let mut failures = vec![];

        for &key in keys {
            match self.get_key(&device, target, key, &state, &message).await {
                Ok(()) => succeeded.push(key.into()),
                Err(failure) => {
                    tracing::warn!(%target, key, %failure, "get failed");
                    failures.push(failure);
                }
            }
        }

        if failures.is_empty() {
            Ok(succeeded)
        } else {
            Err(MultiError { failures, succeeded }.into())
        }
    }

    async fn set_key(
        &self,
        device: &Device,
        target: &Entity,
        key: &str,
        value: &Value,
        state: &Patch,
        message: &Patch,
    ) -> Result<Option<Patch>, KeyFailure> {
        let route = route(device, target, key, Access::SET)?;
        let meta = OutboundMeta {
            key,
            property: route.property,
            endpoint_name: route.endpoint_name,
            target: &route.target,
            options: &device.options,
            state,
            message,
        };

        let outcome = route
            .converter
            .convert_set(value, &meta)
            .map_err(|source| KeyFailure::Convert { key: key.into(), source })?;

        for op in &outcome.ops {
            self.transport
                .execute(op)
                .await
                .map_err(|source| KeyFailure::Transport { key: key.into(), source })?;
        }

        let Some(patch) = outcome.state else {
            return Ok(None);
        };

        let patch = match route.endpoint_name {
            Some(name) => patch
                .into_iter()
                .map(|(property, value)| (format!("{property}_{name}"), value))
                .collect(),
            None => patch,
        };

        self.sink.publish(&target.owner(), patch.clone()).await;
        Ok(Some(patch))
    }

    async fn get_key(
        &self,
        device: &Device,
        target: &Entity,
        key: &str,
        state: &Patch,
        message: &Patch,
    ) -> Result<(), KeyFailure> {
        let route = route(device, target, key, Access::GET)?;
        let meta = OutboundMeta {
            key,
            property: route.property,
            endpoint_name: route.endpoint_name,
            target: &route.target,
            options: &device.options,
            state,
            message,
        };

        let ops = route
            .converter
            .convert_get(&meta)
            .map_err(|source| KeyFailure::Convert { key: key.into(), source })?;

        for op in &ops {
            self.transport
                .execute(op)
                .await
                .map_err(|source| KeyFailure::Transport { key: key.into(), source })?;
        }

        Ok(())
    }

    fn arm(&self, scheduled: Scheduled, queue: Queue) {
        let Scheduled { entity, key, delay, action } = scheduled;
        let transport = self.transport.clone();
        let sink = self.sink.clone();

        // The stored handle covers the delay only; a fired action runs in its own task and is
        // never aborted.
        let task = tokio::spawn({
            let entity = entity.clone();
            let key = key.clone();

            async move {
                tokio::time::sleep(delay).await;
                let guard = queue.lock_owned().await;
                tracing::debug!(%entity, %key, "timer fired");

                tokio::spawn(async move {
                    let _guard = guard;

                    match action {
                        TimerAction::Publish(patch) => sink.publish(&entity.owner(), patch).await,
                        TimerAction::Execute(ops) => {
                            for op in &ops {
                                if let Err(error) = transport.execute(op).await {
                                    tracing::warn!(%entity, %key, %error, "scheduled wire operation failed");
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        self.ctx
            .with_store(|store| store.arm_timer(&entity, &key, task.into()));
    }

    fn device(&self, id: &DeviceId) -> Result<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(id.clone()))
    }

    /// The device whose class serves requests to `target`; groups use their first member
    fn device_for(&self, target: &Entity) -> Result<Arc<Device>> {
        match target {
            Entity::Group { group } => {
                let first = self
                    .groups
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(group)
                    .ok_or(Error::UnknownGroup(*group))?
                    .first()
                    .cloned()
                    .ok_or(Error::EmptyGroup(*group))?;

                self.device(&first)
            }
            Entity::Endpoint { device, .. } | Entity::Device { device } => self.device(device),
        }
    }

    fn queue(&self, owner: &Entity) -> Queue {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(owner.key())
            .or_default()
            .clone()
    }

    fn seen_transaction(&self, id: &DeviceId, sequence: u8) -> bool {
        let mut transactions = self
            .transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let seen = transactions.entry(id.clone()).or_default();
        if seen.contains(&sequence) {
            return true;
        }

        seen.push_front(sequence);
        seen.truncate(TRANSACTION_WINDOW);
        false
    }
}

fn route<'a>(device: &'a Device, target: &Entity, key: &'a str, operation: Access) -> Result<Route<'a>, KeyFailure> {
    let resolved = device.class.endpoints.resolve(key);

    let Some(converter) = device.class.outbound_for(resolved.property) else {
        return Err(KeyFailure::UnsupportedKey { key: key.into() });
    };

    if let Some(node) = find_property(&device.exposes, key)
        && !node.access.contains(operation)
    {
        let operation = if operation == Access::SET { "set" } else { "get" };
        return Err(KeyFailure::AccessDenied { key: key.into(), operation });
    }

    let endpoint = match (target, resolved.endpoint_name) {
        (_, Some(_)) => resolved.endpoint,
        (Entity::Endpoint { endpoint, .. }, None) => Some(*endpoint),
        _ => resolved
            .endpoint
            .or_else(|| device.shape.endpoints.first().copied()),
    };

    let target = match (target, endpoint) {
        (Entity::Endpoint { device, .. } | Entity::Device { device }, Some(endpoint)) => {
            Entity::endpoint(device.clone(), endpoint)
        }
        _ => target.clone(),
    };

    Ok(Route {
        converter,
        property: resolved.property,
        endpoint_name: resolved.endpoint_name,
        target,
    })
}

/// `state_left` → `state` for a node tagged with endpoint `left`
fn base_property(node: &Expose) -> &str {
    let property = node.property.as_deref().unwrap_or(&node.name);

    match &node.endpoint {
        Some(endpoint) => property
            .strip_suffix(format_compact!("_{endpoint}").as_str())
            .unwrap_or(property),
        None => property,
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use kitsune_common::presets;
    use serde_json::json;

    use super::*;
    use crate::{
        catalog::ClassMeta,
        converter::{Inbound, Outbound, SetOutcome, WireOp, field},
        endpoint::EndpointMap,
        publish::MemoryStateSink,
        transport::RecordingTransport,
    };

    const IEEE: &str = "0x00124b001f3c8e21";

    fn patch(value: Value) -> Patch {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        transport: Arc<RecordingTransport>,
        sink: Arc<MemoryStateSink>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(RecordingTransport::new());
        let sink = Arc::new(MemoryStateSink::new());
        let dispatcher = Dispatcher::new(Arc::new(Context::new()), transport.clone(), sink.clone());

        Harness { dispatcher, transport, sink }
    }

    impl Harness {
        fn interview(&self, class: DeviceClass) -> Vec<Expose> {
            self.dispatcher
                .interview(DeviceShape::new(IEEE, "TEST"), Arc::new(class), &Options::new())
                .unwrap()
        }

        async fn state(&self, entity: &Entity) -> Value {
            Value::Object(self.sink.state(entity).await)
        }
    }

    fn on_off() -> Outbound {
        Outbound::new("on_off", &["state"])
            .with_set(|value, meta| {
                let command = match value.as_str() {
                    Some("ON") => "on",
                    Some("OFF") => "off",
                    _ => {
                        return Err(ConvertError::InvalidValue {
                            key: meta.key.into(),
                            value: value.clone(),
                        });
                    }
                };

                Ok(SetOutcome::new(vec![WireOp::command(meta.target, "genOnOff", command, json!({}))])
                    .with_state(patch(json!({ "state": value }))))
            })
            .with_get(|meta| Ok(vec![WireOp::read(meta.target, "genOnOff", ["onOff"])]))
    }

    fn bulb() -> DeviceClass {
        DeviceClass::new("LED-1", "Acme", "Dimmable bulb")
            .with_expose(presets::light().with_brightness())
            .with_inbound(Inbound::new("on_off", "genOnOff", &["attributeReport"], |msg, _| {
                let on = field(msg, "onOff")?.as_u64() == Some(1);
                Ok(Some(patch(json!({ "state": if on { "ON" } else { "OFF" } }))))
            }))
            .with_outbound(on_off())
            .with_outbound(Outbound::new("brightness", &["brightness"]).with_set(|value, meta| {
                Ok(SetOutcome::new(vec![WireOp::command(
                    meta.target,
                    "genLevelCtrl",
                    "moveToLevel",
                    json!({ "level": value }),
                )])
                .with_state(patch(json!({ "brightness": value }))))
            }))
    }

    fn occupancy_sensor() -> DeviceClass {
        DeviceClass::new("PIR-1", "Acme", "Motion sensor").with_inbound(Inbound::new(
            "occupancy",
            "ssIasZone",
            &["commandStatusChangeNotification"],
            |msg, meta| {
                meta.schedule(
                    &msg.endpoint,
                    "occupancy_timer",
                    Duration::from_secs(90),
                    TimerAction::Publish(patch(json!({ "occupancy": false }))),
                );
                Ok(Some(patch(json!({ "occupancy": true }))))
            },
        ))
    }

    fn motion() -> InboundMessage {
        InboundMessage::new(Entity::endpoint(IEEE, 1), "ssIasZone", "commandStatusChangeNotification", json!({}))
    }

    fn occupancy_history(sink: &MemoryStateSink) -> Vec<Value> {
        sink.history()
            .into_iter()
            .filter_map(|(_, patch)| patch.get("occupancy").cloned())
            .collect()
    }

    #[tokio::test]
    async fn inbound_patches_merge_later_wins() {
        let h = harness();
        h.interview(
            DeviceClass::new("MULTI", "Acme", "Sensor")
                .with_inbound(Inbound::new("first", "genBasic", &["attributeReport"], |_, _| {
                    Ok(Some(patch(json!({ "a": 1, "shared": "first" }))))
                }))
                .with_inbound(Inbound::new("second", "genBasic", &["attributeReport"], |_, _| {
                    Ok(Some(patch(json!({ "b": 2, "shared": "second" }))))
                })),
        );

        let msg = InboundMessage::new(Entity::endpoint(IEEE, 1), "genBasic", "attributeReport", json!({}))
            .with_linkquality(120);
        let report = h.dispatcher.handle_inbound(msg).await.unwrap();

        let expected = json!({ "a": 1, "b": 2, "shared": "second", "linkquality": 120 });
        assert_eq!(Value::Object(report.patch), expected);
        assert_eq!(h.state(&Entity::device(IEEE)).await, expected);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn failing_converter_is_isolated() {
        let h = harness();
        h.interview(
            DeviceClass::new("MULTI", "Acme", "Sensor")
                .with_inbound(Inbound::new("broken", "genBasic", &["attributeReport"], |_, meta| {
                    meta.reply(WireOp::read(&Entity::endpoint(IEEE, 1), "genBasic", ["zclVersion"]));
                    Err(ConvertError::Other("boom".to_owned()))
                }))
                .with_inbound(Inbound::new("working", "genBasic", &["attributeReport"], |_, _| {
                    Ok(Some(patch(json!({ "b": 2 }))))
                })),
        );

        let msg = InboundMessage::new(Entity::endpoint(IEEE, 1), "genBasic", "attributeReport", json!({}));
        let report = h.dispatcher.handle_inbound(msg).await.unwrap();

        assert_eq!(Value::Object(report.patch), json!({ "b": 2 }));
        assert_eq!(
            report.failures,
            [ConverterFailure::Convert {
                converter: "broken".into(),
                source: ConvertError::Other("boom".to_owned()),
            }]
        );
        assert!(h.transport.ops().is_empty());
    }

    #[tokio::test]
    async fn unknown_sources_are_rejected() {
        let h = harness();

        let msg = InboundMessage::new(Entity::group(1), "genOnOff", "commandOn", json!({}));
        assert!(matches!(h.dispatcher.handle_inbound(msg).await, Err(Error::NotADevice(_))));

        let msg = InboundMessage::new(Entity::endpoint(IEEE, 1), "genOnOff", "commandOn", json!({}));
        assert!(matches!(h.dispatcher.handle_inbound(msg).await, Err(Error::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn set_collects_per_key_failures() {
        let h = harness();
        h.interview(bulb());
        h.transport.fail_cluster("genLevelCtrl");

        let device = Entity::device(IEEE);
        let request = patch(json!({ "state": "ON", "brightness": 10, "color": { "x": 0.3 } }));
        let Err(Error::Partial(multi)) = h.dispatcher.set(&device, request).await else {
            panic!("expected a partial failure");
        };

        assert_eq!(multi.succeeded, ["state"]);
        assert_eq!(multi.failures.len(), 2);
        assert!(multi.failures.iter().any(|f| matches!(
            f,
            KeyFailure::Transport { key, .. } if key == "brightness"
        )));
        assert!(multi.failures.contains(&KeyFailure::UnsupportedKey { key: "color".into() }));

        assert_eq!(
            h.transport.ops(),
            [WireOp::command(&Entity::endpoint(IEEE, 1), "genOnOff", "on", json!({}))]
        );
        assert_eq!(h.state(&device).await, json!({ "state": "ON" }));
    }

    #[tokio::test]
    async fn converter_errors_stay_with_their_key() {
        let h = harness();
        h.interview(bulb());

        let device = Entity::device(IEEE);
        let request = patch(json!({ "state": "DIM", "brightness": 10 }));
        let Err(Error::Partial(multi)) = h.dispatcher.set(&device, request).await else {
            panic!("expected a partial failure");
        };

        assert_eq!(multi.succeeded, ["brightness"]);
        assert_eq!(multi.failures, [KeyFailure::Convert {
            key: "state".into(),
            source: ConvertError::InvalidValue { key: "state".into(), value: json!("DIM") },
        }]);

        assert_eq!(
            h.transport.ops(),
            [WireOp::command(&Entity::endpoint(IEEE, 1), "genLevelCtrl", "moveToLevel", json!({ "level": 10 }))]
        );
        assert_eq!(h.state(&device).await, json!({ "brightness": 10 }));
    }

    #[tokio::test]
    async fn set_publishes_optimistic_state() {
        let h = harness();
        h.interview(bulb());

        let device = Entity::device(IEEE);
        let report = h
            .dispatcher
            .set_value(&device, json!({ "state": "ON", "brightness": 200 }))
            .await
            .unwrap();

        assert_eq!(Value::Object(report.state), json!({ "state": "ON", "brightness": 200 }));
        assert_eq!(h.state(&device).await, json!({ "state": "ON", "brightness": 200 }));

        // a later report overwrites the optimistic value
        let msg = InboundMessage::new(Entity::endpoint(IEEE, 1), "genOnOff", "attributeReport", json!({ "onOff": 0 }));
        h.dispatcher.handle_inbound(msg).await.unwrap();
        assert_eq!(h.state(&device).await, json!({ "state": "OFF", "brightness": 200 }));

        assert!(matches!(
            h.dispatcher.set_value(&device, json!("ON")).await,
            Err(Error::SerdeJson(_))
        ));
    }

    #[tokio::test]
    async fn access_is_enforced() {
        let h = harness();
        h.interview(
            DeviceClass::new("TRV-1", "Acme", "Radiator valve")
                .with_expose(presets::climate().with_local_temperature())
                .with_outbound(
                    Outbound::new("local_temperature", &["local_temperature"])
                        .with_set(|_, _| Ok(SetOutcome::default()))
                        .with_get(|meta| {
                            Ok(vec![WireOp::read(meta.target, "hvacThermostat", ["localTemp"])])
                        }),
                ),
        );

        let device = Entity::device(IEEE);
        let Err(Error::Partial(multi)) = h
            .dispatcher
            .set(&device, patch(json!({ "local_temperature": 20 })))
            .await
        else {
            panic!("expected a partial failure");
        };
        assert_eq!(
            multi.failures,
            [KeyFailure::AccessDenied { key: "local_temperature".into(), operation: "set" }]
        );

        let read = h.dispatcher.get(&device, &["local_temperature"]).await.unwrap();
        assert_eq!(read, ["local_temperature"]);
        assert_eq!(
            h.transport.ops(),
            [WireOp::read(&Entity::endpoint(IEEE, 1), "hvacThermostat", ["localTemp"])]
        );
    }

    #[tokio::test]
    async fn get_without_reader_fails() {
        let h = harness();
        h.interview(bulb());

        let Err(Error::Partial(multi)) = h
            .dispatcher
            .get(&Entity::device(IEEE), &["state", "brightness"])
            .await
        else {
            panic!("expected a partial failure");
        };

        assert_eq!(multi.succeeded, ["state"]);
        assert_eq!(
            multi.failures,
            [KeyFailure::Convert {
                key: "brightness".into(),
                source: ConvertError::NotReadable("brightness".into()),
            }]
        );
    }

    #[test]
    fn interview_rejects_unclaimed_set() {
        let h = harness();
        let class = DeviceClass::new("LED-2", "Acme", "Bulb").with_expose(presets::light().with_brightness());

        let result = h
            .dispatcher
            .interview(DeviceShape::new(IEEE, "LED-2"), Arc::new(class), &Options::new());

        assert!(matches!(
            result,
            Err(Error::Expose(ExposeError::Unclaimed { property })) if property == "state"
        ));
    }

    #[test]
    fn interview_merges_options() {
        let h = harness();
        let class = bulb()
            .with_default("transition", 0)
            .with_default("color_sync", true)
            .with_meta(ClassMeta {
                options: patch(json!({ "transition": 1 })),
                ..Default::default()
            });

        let exposes = h
            .dispatcher
            .interview(
                DeviceShape::new(IEEE, "LED-1"),
                Arc::new(class),
                &patch(json!({ "color_sync": false })),
            )
            .unwrap();

        assert_eq!(exposes.last().unwrap().name, "linkquality");
        assert_eq!(
            Value::Object(h.dispatcher.options(&DeviceId::from(IEEE)).unwrap()),
            json!({ "transition": 1, "color_sync": false })
        );
    }

    #[tokio::test]
    async fn endpoint_keys_route_and_suffix() {
        let h = harness();
        h.interview(
            DeviceClass::new("TS0012", "Tuya", "Two gang switch")
                .with_endpoints(EndpointMap::new().with("left", 1).with("right", 2))
                .with_expose(presets::switch().with_state("state", "Left relay").with_endpoint("left"))
                .with_expose(presets::switch().with_state("state", "Right relay").with_endpoint("right"))
                .with_outbound(on_off()),
        );

        let device = Entity::device(IEEE);
        h.dispatcher
            .set(&device, patch(json!({ "state_right": "OFF" })))
            .await
            .unwrap();

        assert_eq!(
            h.transport.ops(),
            [WireOp::command(&Entity::endpoint(IEEE, 2), "genOnOff", "off", json!({}))]
        );
        assert_eq!(h.state(&device).await, json!({ "state_right": "OFF" }));
    }

    #[tokio::test]
    async fn duplicate_transactions_are_dropped() {
        let h = harness();
        h.interview(bulb());

        let report = |sequence| {
            InboundMessage::new(Entity::endpoint(IEEE, 1), "genOnOff", "attributeReport", json!({ "onOff": 1 }))
                .with_transaction_sequence(sequence)
        };

        assert!(!h.dispatcher.handle_inbound(report(7)).await.unwrap().duplicate);
        assert!(h.dispatcher.handle_inbound(report(7)).await.unwrap().duplicate);

        for sequence in 8..=12 {
            h.dispatcher.handle_inbound(report(sequence)).await.unwrap();
        }

        // 7 fell out of the window
        assert!(!h.dispatcher.handle_inbound(report(7)).await.unwrap().duplicate);
        assert_eq!(h.sink.history().len(), 7);
    }

    #[tokio::test]
    async fn duplicates_can_be_published() {
        let h = harness();
        h.interview(bulb().with_meta(ClassMeta {
            publish_duplicate_transaction: true,
            ..Default::default()
        }));

        let report =
            InboundMessage::new(Entity::endpoint(IEEE, 1), "genOnOff", "attributeReport", json!({ "onOff": 1 }))
                .with_transaction_sequence(3);

        assert!(!h.dispatcher.handle_inbound(report.clone()).await.unwrap().duplicate);
        assert!(!h.dispatcher.handle_inbound(report).await.unwrap().duplicate);
        assert_eq!(h.sink.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_a_timer_replaces_it() {
        let h = harness();
        h.interview(occupancy_sensor());

        h.dispatcher.handle_inbound(motion()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        h.dispatcher.handle_inbound(motion()).await.unwrap();

        // the first timer would have fired at 90s
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(occupancy_history(&h.sink), [json!(true), json!(true)]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(occupancy_history(&h.sink), [json!(true), json!(true), json!(false)]);
        assert_eq!(h.state(&Entity::device(IEEE)).await, json!({ "occupancy": false }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timers() {
        let h = harness();
        h.interview(occupancy_sensor());

        h.dispatcher.handle_inbound(motion()).await.unwrap();
        assert_eq!(h.dispatcher.stop(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(occupancy_history(&h.sink), [json!(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_issued_operations_finish() {
        let h = harness();
        h.transport.delay_cluster("genOnOff", Duration::from_secs(5));
        h.interview(DeviceClass::new("SW-1", "Acme", "Timed switch").with_inbound(Inbound::new(
            "auto_off",
            "genOnOff",
            &["attributeReport"],
            |msg, meta| {
                meta.schedule(
                    &msg.endpoint,
                    "auto_off",
                    Duration::from_secs(10),
                    TimerAction::Execute(vec![WireOp::command(&msg.endpoint, "genOnOff", "off", json!({}))]),
                );
                Ok(None)
            },
        )));

        let report = InboundMessage::new(Entity::endpoint(IEEE, 1), "genOnOff", "attributeReport", json!({}));
        h.dispatcher.handle_inbound(report).await.unwrap();

        // fired at 10s, the command is in flight until 15s
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(h.dispatcher.stop(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            h.transport.ops(),
            [WireOp::command(&Entity::endpoint(IEEE, 1), "genOnOff", "off", json!({}))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_entity_work_is_serialized() {
        let h = harness();
        h.transport.delay_cluster("genPollCtrl", Duration::from_secs(5));
        h.interview(DeviceClass::new("POLL-1", "Acme", "Sleepy sensor").with_inbound(Inbound::new(
            "checkin",
            "genPollCtrl",
            &["commandCheckin"],
            |msg, meta| {
                let step = field(msg, "step")?.clone();
                if step == json!(1) {
                    meta.reply(WireOp::command(&msg.endpoint, "genPollCtrl", "checkinRsp", json!({})));
                }
                Ok(Some(patch(json!({ "step": step }))))
            },
        )));

        let checkin = |step: u32| {
            InboundMessage::new(Entity::endpoint(IEEE, 1), "genPollCtrl", "commandCheckin", json!({ "step": step }))
        };

        let (first, second) = tokio::join!(
            h.dispatcher.handle_inbound(checkin(1)),
            h.dispatcher.handle_inbound(checkin(2)),
        );
        first.unwrap();
        second.unwrap();

        let steps: Vec<_> = h.sink.history().into_iter().map(|(_, patch)| patch["step"].clone()).collect();
        assert_eq!(steps, [json!(1), json!(2)]);
        assert_eq!(h.transport.ops().len(), 1);
    }

    #[tokio::test]
    async fn groups_use_their_first_member() {
        let h = harness();
        h.interview(bulb());
        h.dispatcher.add_group(5, [DeviceId::from(IEEE)]);
        h.dispatcher.add_group(6, []);

        let group = Entity::group(5);
        h.dispatcher.set(&group, patch(json!({ "state": "ON" }))).await.unwrap();

        assert_eq!(h.transport.ops(), [WireOp::command(&group, "genOnOff", "on", json!({}))]);
        assert_eq!(h.state(&group).await, json!({ "state": "ON" }));

        let request = patch(json!({ "state": "ON" }));
        assert!(matches!(
            h.dispatcher.set(&Entity::group(6), request.clone()).await,
            Err(Error::EmptyGroup(6))
        ));
        assert!(matches!(
            h.dispatcher.set(&Entity::group(7), request).await,
            Err(Error::UnknownGroup(7))
        ));
    }

    #[tokio::test]
    async fn configure_runs_class_routine() {
        let h = harness();
        h.interview(bulb().with_configure(|shape| {
            let endpoint = Entity::endpoint(shape.ieee.clone(), 1);
            vec![WireOp::Bind {
                target: endpoint.clone(),
                cluster: "genOnOff".into(),
                destination: Entity::device("0x0000000000000000"),
            }]
        }));

        h.dispatcher.configure(&DeviceId::from(IEEE)).await.unwrap();
        assert!(matches!(&h.transport.ops()[..], [WireOp::Bind { .. }]));
    }

    #[tokio::test]
    async fn remove_device_clears_runtime_state() {
        let h = harness();
        h.interview(DeviceClass::new("CNT-1", "Acme", "Counter").with_inbound(Inbound::new(
            "counter",
            "genAnalogInput",
            &["attributeReport"],
            |msg, meta| {
                let count = meta.store.get_or(&msg.endpoint, "count", json!(0)).as_u64().unwrap_or(0) + 1;
                meta.store.put(&msg.endpoint, "count", count);
                Ok(Some(patch(json!({ "count": count }))))
            },
        )));

        let msg = InboundMessage::new(Entity::endpoint(IEEE, 1), "genAnalogInput", "attributeReport", json!({}));
        h.dispatcher.handle_inbound(msg.clone()).await.unwrap();
        let report = h.dispatcher.handle_inbound(msg).await.unwrap();
        assert_eq!(report.patch["count"], json!(2));

        let id = DeviceId::from(IEEE);
        assert!(h.dispatcher.remove_device(&id));
        assert!(h.dispatcher.context().with_store(|store| store.is_empty()));
        assert!(matches!(h.dispatcher.exposes(&id), Err(Error::UnknownDevice(_))));
        assert!(!h.dispatcher.remove_device(&id));
    }
}
