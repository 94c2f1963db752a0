//! Device classes and the catalog that finds them
//!
//! A [`DeviceClass`] is a data record: the converters, exposes, endpoint names and options
//! of one device model. The [`Catalog`] indexes classes by the model ids devices report.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use compact_str::CompactString;
use kitsune_common::{
    DeviceId,
    expose::{Expose, find_property},
    presets,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    converter::{InboundConverter, OutboundConverter, WireOp},
    endpoint::EndpointMap,
    options::Options,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("device class has an empty {0}")]
    MissingField(&'static str),
    #[error("{model}: model id {model_id:?} is listed twice")]
    DuplicateModelId { model: CompactString, model_id: CompactString },
}

/// What a device told us about itself during the interview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceShape {
    pub ieee: DeviceId,
    pub model_id: CompactString,
    #[serde(default)]
    pub manufacturer: CompactString,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<u8>,
}

fn default_endpoints() -> Vec<u8> {
    vec![1]
}

impl Default for DeviceShape {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl DeviceShape {
    pub fn new(ieee: impl Into<DeviceId>, model_id: &str) -> Self {
        Self {
            ieee: ieee.into(),
            model_id: model_id.into(),
            manufacturer: CompactString::default(),
            endpoints: default_endpoints(),
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: &str) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_endpoints(mut self, endpoints: &[u8]) -> Self {
        self.endpoints = endpoints.to_vec();
        self
    }
}

/// Class-wide behavior switches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassMeta {
    /// Inbound properties are suffixed with the reporting endpoint's name
    pub multi_endpoint: bool,
    /// Properties that stay unsuffixed on multi-endpoint classes
    pub multi_endpoint_skip: Vec<CompactString>,
    /// Publish messages even if their transaction sequence number was seen recently
    pub publish_duplicate_transaction: bool,
    /// Option layer between the class defaults and the user's options
    pub options: Options,
}

type ExposeFn = dyn Fn(&DeviceShape, &Options) -> Vec<Expose> + Send + Sync;
type ConfigureFn = dyn Fn(&DeviceShape) -> Vec<WireOp> + Send + Sync;

pub enum Exposes {
    Static(Vec<Expose>),
    /// Built per device, from its shape and options
    Dynamic(Box<ExposeFn>),
}

pub struct DeviceClass {
    pub model: CompactString,
    pub vendor: CompactString,
    pub description: CompactString,
    /// Model ids reported by devices of this class
    pub model_ids: Vec<CompactString>,
    pub inbound: Vec<Box<dyn InboundConverter>>,
    pub outbound: Vec<Box<dyn OutboundConverter>>,
    pub exposes: Exposes,
    pub endpoints: EndpointMap,
    /// Options users may set for devices of this class
    pub options: Vec<Expose>,
    pub defaults: Options,
    pub meta: ClassMeta,
    configure: Option<Box<ConfigureFn>>,
}

impl DeviceClass {
    pub fn new(model: &str, vendor: &str, description: &str) -> Self {
        Self {
            model: model.into(),
            vendor: vendor.into(),
            description: description.into(),
            model_ids: vec![],
            inbound: vec![],
            outbound: vec![],
            exposes: Exposes::Static(vec![]),
            endpoints: EndpointMap::new(),
            options: vec![],
            defaults: Options::new(),
            meta: ClassMeta::default(),
            configure: None,
        }
    }

    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_ids.push(model_id.into());
        self
    }

    pub fn with_inbound(mut self, converter: impl InboundConverter + 'static) -> Self {
        self.inbound.push(Box::new(converter));
        self
    }

    pub fn with_outbound(mut self, converter: impl OutboundConverter + 'static) -> Self {
        self.outbound.push(Box::new(converter));
        self
    }

    pub fn with_expose(mut self, expose: Expose) -> Self {
        if let Exposes::Static(exposes) = &mut self.exposes {
            exposes.push(expose);
        } else {
            self.exposes = Exposes::Static(vec![expose]);
        }
        self
    }

    pub fn with_dynamic_exposes(
        mut self,
        build: impl Fn(&DeviceShape, &Options) -> Vec<Expose> + Send + Sync + 'static,
    ) -> Self {
        self.exposes = Exposes::Dynamic(Box::new(build));
        self
    }

    pub fn with_endpoints(mut self, endpoints: EndpointMap) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_option(mut self, option: Expose) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_default(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_meta(mut self, meta: ClassMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_configure(
        mut self,
        configure: impl Fn(&DeviceShape) -> Vec<WireOp> + Send + Sync + 'static,
    ) -> Self {
        self.configure = Some(Box::new(configure));
        self
    }

    /// Expose tree for one device; `linkquality` is always part of it
    pub fn build_exposes(&self, shape: &DeviceShape, options: &Options) -> Vec<Expose> {
        let mut exposes = match &self.exposes {
            Exposes::Static(exposes) => exposes.clone(),
            Exposes::Dynamic(build) => build(shape, options),
        };

        if find_property(&exposes, "linkquality").is_none() {
            exposes.push(presets::linkquality());
        }

        exposes
    }

    pub fn configure_ops(&self, shape: &DeviceShape) -> Vec<WireOp> {
        self.configure
            .as_ref()
            .map(|configure| configure(shape))
            .unwrap_or_default()
    }

    pub fn outbound_for(&self, property: &str) -> Option<&dyn OutboundConverter> {
        self.outbound
            .iter()
            .find(|converter| converter.claims(property))
            .map(|converter| &**converter)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for (field, value) in [
            ("model", &self.model),
            ("vendor", &self.vendor),
            ("description", &self.description),
        ] {
            if value.trim().is_empty() {
                return Err(CatalogError::MissingField(field));
            }
        }

        for (i, model_id) in self.model_ids.iter().enumerate() {
            if self.model_ids[..i]
                .iter()
                .any(|other| other.eq_ignore_ascii_case(model_id))
            {
                return Err(CatalogError::DuplicateModelId {
                    model: self.model.clone(),
                    model_id: model_id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Adds the options declared by converters to the class's own, first declaration wins
    fn collect_converter_options(&mut self) {
        let declared = self
            .inbound
            .iter()
            .flat_map(|converter| converter.options())
            .chain(self.outbound.iter().flat_map(|converter| converter.options()))
            .collect::<Vec<_>>();

        for option in declared {
            if !self.options.iter().any(|existing| existing.name == option.name) {
                self.options.push(option);
            }
        }
    }
}

#[derive(Default)]
pub struct Catalog {
    classes: Vec<Arc<DeviceClass>>,
    by_model_id: HashMap<CompactString, Vec<usize>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut class: DeviceClass) -> Result<Arc<DeviceClass>, CatalogError> {
        class.validate()?;
        class.collect_converter_options();

        let index = self.classes.len();
        let keys = if class.model_ids.is_empty() {
            vec![normalize(&class.model)]
        } else {
            class.model_ids.iter().map(|id| normalize(id)).collect()
        };

        for key in keys {
            match self.by_model_id.entry(key) {
                Entry::Occupied(mut entry) => {
                    tracing::debug!(model = %class.model, model_id = %entry.key(), "model id claimed again, newest class wins");
                    entry.get_mut().insert(0, index);
                }
                Entry::Vacant(entry) => {
                    entry.insert(vec![index]);
                }
            }
        }

        let class = Arc::new(class);
        self.classes.push(class.clone());
        Ok(class)
    }

    /// Finds the class for a reported model id, ignoring case and NUL padding
    pub fn find(&self, model_id: &str) -> Option<Arc<DeviceClass>> {
        let candidates = self
            .by_model_id
            .get(&normalize(model_id))
            .or_else(|| self.by_model_id.get(&normalize(strip_nul(model_id))))?;

        candidates.first().map(|&index| self.classes[index].clone())
    }

    pub fn find_by_model(&self, model: &str) -> Option<Arc<DeviceClass>> {
        self.classes
            .iter()
            .rev()
            .find(|class| class.model.eq_ignore_ascii_case(model))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

fn normalize(model_id: &str) -> CompactString {
    model_id.to_lowercase().into()
}

/// `TS0601\0\0\0` → `TS0601`
fn strip_nul(model_id: &str) -> &str {
    model_id.split('\0').next().unwrap_or(model_id).trim()
}
