//! Declarative description of what a device can do
//!
//! Every device class publishes a tree of [`Expose`] nodes. Leaf nodes describe a single
//! property (its type, constraints and [`Access`]); composites group several values under one
//! property; presets (see [`crate::presets`]) expand into a fixed set of standardized leaves so
//! that, say, every thermostat looks the same to consumers.
//!
//! Builders never fail on their own. Misuse (e.g. a unit on a binary node) and malformed
//! constraints are reported by [`Expose::validate`], which is run when a device is interviewed.

use compact_str::{CompactString, format_compact};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Access, label_from_name};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ExposeError {
    #[error("expose has an empty name")]
    EmptyName,
    #[error("{name}: value_min {min} is greater than value_max {max}")]
    InvalidRange { name: CompactString, min: f64, max: f64 },
    #[error("{name}: value_step must be positive, got {step}")]
    InvalidStep { name: CompactString, step: f64 },
    #[error("{name}: enum has no values")]
    EmptyEnum { name: CompactString },
    #[error("{name}: length_min {min} is greater than length_max {max}")]
    InvalidLength { name: CompactString, min: usize, max: usize },
    #[error("{name}: config expose must be settable")]
    ConfigNotSettable { name: CompactString },
    #[error("{name}: diagnostic expose must not be settable")]
    DiagnosticSettable { name: CompactString },
    #[error("{name}: {value:?} is not allowed in a {preset} preset")]
    NotAllowed { name: CompactString, value: CompactString, preset: PresetKind },
    #[error("{name}: {method} does not apply to a {kind} expose")]
    Misapplied { name: CompactString, method: &'static str, kind: &'static str },
    #[error("{property}: settable, but no outbound converter claims it")]
    Unclaimed { property: CompactString },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Device configuration; must be settable
    Config,
    /// Device health information; must not be settable
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetKind {
    Light,
    Switch,
    Lock,
    Cover,
    Fan,
    Climate,
}

impl PresetKind {
    pub fn name(self) -> &'static str {
        match self {
            PresetKind::Light => "light",
            PresetKind::Switch => "switch",
            PresetKind::Lock => "lock",
            PresetKind::Cover => "cover",
            PresetKind::Fan => "fan",
            PresetKind::Climate => "climate",
        }
    }
}

impl core::fmt::Display for PresetKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expose {
    #[serde(flatten)]
    pub kind: ExposeKind,
    pub name: CompactString,
    pub label: CompactString,
    /// Key under which the value appears in published state; `None` for presets and list items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<CompactString>,
    pub access: Access,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<CompactString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<CompactString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip)]
    defect: Option<ExposeError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExposeKind {
    Numeric(Numeric),
    Binary(Binary),
    Enum(Enumeration),
    Text,
    Composite { features: Vec<Expose> },
    List(List),
    Preset { preset: PresetKind, features: Vec<Expose> },
}

impl ExposeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExposeKind::Numeric(_) => "numeric",
            ExposeKind::Binary(_) => "binary",
            ExposeKind::Enum(_) => "enum",
            ExposeKind::Text => "text",
            ExposeKind::Composite { .. } => "composite",
            ExposeKind::List(_) => "list",
            ExposeKind::Preset { .. } => "preset",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Numeric {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<CompactString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_step: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<NumericPreset>,
}

/// A named special value of a numeric property, e.g. `previous = 255`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericPreset {
    pub name: CompactString,
    pub value: Value,
    pub description: CompactString,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binary {
    pub value_on: Value,
    pub value_off: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_toggle: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enumeration {
    pub values: Vec<CompactString>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct List {
    pub item_type: Box<Expose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_min: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_max: Option<usize>,
}

impl Expose {
    fn new(kind: ExposeKind, name: &str, access: Access) -> Self {
        Expose {
            kind,
            name: name.into(),
            label: label_from_name(name),
            property: Some(name.into()),
            access,
            description: None,
            endpoint: None,
            category: None,
            defect: None,
        }
    }

    pub fn numeric(name: &str, access: Access) -> Self {
        Self::new(ExposeKind::Numeric(Numeric::default()), name, access)
    }

    pub fn binary(
        name: &str,
        access: Access,
        value_on: impl Into<Value>,
        value_off: impl Into<Value>,
    ) -> Self {
        let binary = Binary {
            value_on: value_on.into(),
            value_off: value_off.into(),
            value_toggle: None,
        };

        Self::new(ExposeKind::Binary(binary), name, access)
    }

    pub fn enumeration<S: Into<CompactString>>(
        name: &str,
        access: Access,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        Self::new(ExposeKind::Enum(Enumeration { values }), name, access)
    }

    pub fn text(name: &str, access: Access) -> Self {
        Self::new(ExposeKind::Text, name, access)
    }

    pub fn composite(name: &str, property: &str, access: Access) -> Self {
        Self::new(ExposeKind::Composite { features: vec![] }, name, access).with_property(property)
    }

    pub fn list(name: &str, access: Access, mut item_type: Expose) -> Self {
        item_type.property = None;

        let list = List {
            item_type: Box::new(item_type),
            length_min: None,
            length_max: None,
        };

        Self::new(ExposeKind::List(list), name, access)
    }

    pub(crate) fn preset(preset: PresetKind) -> Self {
        let mut expose = Self::new(
            ExposeKind::Preset { preset, features: vec![] },
            preset.name(),
            Access::empty(),
        );
        expose.property = None;
        expose
    }

    pub fn with_property(mut self, property: &str) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Tags this node (and the direct children of composites and presets) with a named
    /// endpoint, suffixing their properties with `_<endpoint>`
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.into());
        self.property = self
            .property
            .take()
            .map(|property| format_compact!("{property}_{endpoint}"));

        if let Some(features) = self.features_mut() {
            for feature in features.iter_mut() {
                if let Some(property) = feature.property.take() {
                    feature.property = Some(format_compact!("{property}_{endpoint}"));
                    feature.endpoint = Some(endpoint.into());
                }
            }
        }

        self
    }

    pub fn with_feature(mut self, feature: Expose) -> Self {
        let feature = match &self.endpoint {
            Some(endpoint) => feature.with_endpoint(endpoint),
            None => feature,
        };

        let access = feature.access;
        let is_preset = matches!(self.kind, ExposeKind::Preset { .. });

        match self.features_mut() {
            Some(features) => features.push(feature),
            None => {
                self.misapplied("with_feature");
                return self;
            }
        }

        if is_preset {
            self.access |= access;
        }

        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        if let Some(numeric) = self.numeric_mut("with_unit") {
            numeric.unit = Some(unit.into());
        }
        self
    }

    pub fn with_value_min(mut self, min: f64) -> Self {
        if let Some(numeric) = self.numeric_mut("with_value_min") {
            numeric.value_min = Some(min);
        }
        self
    }

    pub fn with_value_max(mut self, max: f64) -> Self {
        if let Some(numeric) = self.numeric_mut("with_value_max") {
            numeric.value_max = Some(max);
        }
        self
    }

    pub fn with_value_step(mut self, step: f64) -> Self {
        if let Some(numeric) = self.numeric_mut("with_value_step") {
            numeric.value_step = Some(step);
        }
        self
    }

    pub fn with_preset(mut self, name: &str, value: impl Into<Value>, description: &str) -> Self {
        if let Some(numeric) = self.numeric_mut("with_preset") {
            numeric.presets.push(NumericPreset {
                name: name.into(),
                value: value.into(),
                description: description.into(),
            });
        }
        self
    }

    pub fn with_value_toggle(mut self, toggle: impl Into<Value>) -> Self {
        if !matches!(self.kind, ExposeKind::Binary(_)) {
            self.misapplied("with_value_toggle");
        } else if let ExposeKind::Binary(binary) = &mut self.kind {
            binary.value_toggle = Some(toggle.into());
        }
        self
    }

    pub fn with_length_min(mut self, min: usize) -> Self {
        if let Some(list) = self.list_mut("with_length_min") {
            list.length_min = Some(min);
        }
        self
    }

    pub fn with_length_max(mut self, max: usize) -> Self {
        if let Some(list) = self.list_mut("with_length_max") {
            list.length_max = Some(max);
        }
        self
    }

    pub fn features(&self) -> &[Expose] {
        match &self.kind {
            ExposeKind::Composite { features } | ExposeKind::Preset { features, .. } => features,
            _ => &[],
        }
    }

    /// Nodes that are addressable as top-level state keys; presets are flattened into their
    /// features, composites count as one property
    pub fn properties(&self) -> Vec<&Expose> {
        match &self.kind {
            ExposeKind::Preset { features, .. } => {
                features.iter().flat_map(Expose::properties).collect()
            }
            _ if self.property.is_some() => vec![self],
            _ => vec![],
        }
    }

    pub fn validate(&self) -> Result<(), ExposeError> {
        if let Some(defect) = &self.defect {
            return Err(defect.clone());
        }

        if self.name.is_empty() {
            return Err(ExposeError::EmptyName);
        }

        match self.category {
            Some(Category::Config) if !self.access.contains(Access::SET) => {
                return Err(ExposeError::ConfigNotSettable { name: self.name.clone() });
            }
            Some(Category::Diagnostic) if self.access.contains(Access::SET) => {
                return Err(ExposeError::DiagnosticSettable { name: self.name.clone() });
            }
            _ => {}
        }

        match &self.kind {
            ExposeKind::Numeric(numeric) => {
                if let (Some(min), Some(max)) = (numeric.value_min, numeric.value_max)
                    && min > max
                {
                    return Err(ExposeError::InvalidRange { name: self.name.clone(), min, max });
                }

                if let Some(step) = numeric.value_step
                    && step <= 0.
                {
                    return Err(ExposeError::InvalidStep { name: self.name.clone(), step });
                }
            }
            ExposeKind::Enum(enumeration) => {
                if enumeration.values.is_empty() {
                    return Err(ExposeError::EmptyEnum { name: self.name.clone() });
                }
            }
            ExposeKind::List(list) => {
                if let (Some(min), Some(max)) = (list.length_min, list.length_max)
                    && min > max
                {
                    return Err(ExposeError::InvalidLength { name: self.name.clone(), min, max });
                }

                list.item_type.validate()?;
            }
            ExposeKind::Composite { features } => {
                for feature in features {
                    feature.validate()?;
                }
            }
            ExposeKind::Preset { preset, features } => {
                for feature in features {
                    feature.validate()?;
                }

                crate::presets::check_preset(*preset, features)?;
            }
            ExposeKind::Binary(_) | ExposeKind::Text => {}
        }

        Ok(())
    }

    pub(crate) fn misapplied(&mut self, method: &'static str) {
        if self.defect.is_none() {
            self.defect = Some(ExposeError::Misapplied {
                name: self.name.clone(),
                method,
                kind: self.kind.type_name(),
            });
        }
    }

    fn features_mut(&mut self) -> Option<&mut Vec<Expose>> {
        match &mut self.kind {
            ExposeKind::Composite { features } | ExposeKind::Preset { features, .. } => {
                Some(features)
            }
            _ => None,
        }
    }

    fn numeric_mut(&mut self, method: &'static str) -> Option<&mut Numeric> {
        if !matches!(self.kind, ExposeKind::Numeric(_)) {
            self.misapplied(method);
            return None;
        }

        match &mut self.kind {
            ExposeKind::Numeric(numeric) => Some(numeric),
            _ => None,
        }
    }

    fn list_mut(&mut self, method: &'static str) -> Option<&mut List> {
        if !matches!(self.kind, ExposeKind::List(_)) {
            self.misapplied(method);
            return None;
        }

        match &mut self.kind {
            ExposeKind::List(list) => Some(list),
            _ => None,
        }
    }
}

/// Finds the node published under `property` anywhere in a device's expose list
pub fn find_property<'a>(exposes: &'a [Expose], property: &str) -> Option<&'a Expose> {
    exposes
        .iter()
        .flat_map(Expose::properties)
        .find(|expose| expose.property.as_deref() == Some(property))
}
