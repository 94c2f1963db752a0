//! Standardized expose bundles
//!
//! A preset expands into a fixed set of primitive nodes so that every light, switch or
//! thermostat is described the same way, whatever the device speaks on the wire. Preset
//! builder methods only apply to their own preset kind; calling one on anything else is
//! recorded as a defect and reported by [`Expose::validate`].

use crate::{
    Access,
    expose::{Category, Expose, ExposeError, ExposeKind, PresetKind},
};

const SETPOINTS: &[&str] = &[
    "occupied_heating_setpoint",
    "current_heating_setpoint",
    "occupied_cooling_setpoint",
    "unoccupied_heating_setpoint",
    "unoccupied_cooling_setpoint",
];

const SYSTEM_MODES: &[&str] = &["off", "heat", "cool", "auto", "dry", "fan_only", "sleep", "emergency_heating"];
const RUNNING_STATES: &[&str] = &["idle", "heat", "cool", "fan_only"];
const FAN_MODES: &[&str] = &["off", "low", "medium", "high", "on", "auto", "smart"];

/// Default mired range when a light doesn't declare its own
pub const COLOR_TEMP_RANGE: (f64, f64) = (150., 500.);

pub fn light() -> Expose {
    Expose::preset(PresetKind::Light).with_feature(
        Expose::binary("state", Access::ALL, "ON", "OFF")
            .with_value_toggle("TOGGLE")
            .with_description("On/off state of this light"),
    )
}

pub fn switch() -> Expose {
    Expose::preset(PresetKind::Switch)
}

pub fn lock() -> Expose {
    Expose::preset(PresetKind::Lock)
}

pub fn cover() -> Expose {
    Expose::preset(PresetKind::Cover).with_feature(Expose::enumeration(
        "state",
        Access::STATE_SET,
        ["OPEN", "CLOSE", "STOP"],
    ))
}

pub fn fan() -> Expose {
    Expose::preset(PresetKind::Fan).with_feature(
        Expose::binary("state", Access::ALL, "ON", "OFF")
            .with_property("fan_state")
            .with_description("On/off state of this fan"),
    )
}

pub fn climate() -> Expose {
    Expose::preset(PresetKind::Climate)
}

pub fn temperature() -> Expose {
    Expose::numeric("temperature", Access::STATE)
        .with_unit("°C")
        .with_description("Measured temperature value")
}

pub fn humidity() -> Expose {
    Expose::numeric("humidity", Access::STATE)
        .with_unit("%")
        .with_description("Measured relative humidity")
}

pub fn battery() -> Expose {
    Expose::numeric("battery", Access::STATE)
        .with_unit("%")
        .with_value_min(0.)
        .with_value_max(100.)
        .with_description("Remaining battery in %")
        .with_category(Category::Diagnostic)
}

pub fn linkquality() -> Expose {
    Expose::numeric("linkquality", Access::STATE)
        .with_unit("lqi")
        .with_value_min(0.)
        .with_value_max(255.)
        .with_description("Link quality (signal strength)")
        .with_category(Category::Diagnostic)
}

pub fn action<S: Into<compact_str::CompactString>>(values: impl IntoIterator<Item = S>) -> Expose {
    Expose::enumeration("action", Access::STATE, values)
        .with_description("Triggered action (e.g. a button click)")
        .with_category(Category::Diagnostic)
}

pub fn power_on_behavior() -> Expose {
    Expose::enumeration("power_on_behavior", Access::ALL, ["off", "previous", "on"])
        .with_label("Power-on behavior")
        .with_description("Controls the behavior when the device is powered on after power loss")
        .with_category(Category::Config)
}

pub fn child_lock() -> Expose {
    lock().with_label("Child lock").with_feature(
        Expose::binary("state", Access::STATE_SET, "LOCK", "UNLOCK")
            .with_property("child_lock")
            .with_description("Enables/disables physical input on the device"),
    )
}

impl Expose {
    pub fn with_brightness(self) -> Self {
        self.with_preset_feature(
            PresetKind::Light,
            "with_brightness",
            Expose::numeric("brightness", Access::ALL)
                .with_value_min(0.)
                .with_value_max(254.)
                .with_description("Brightness of this light"),
        )
    }

    /// Color temperature in mireds; named presets outside `range` are left out
    pub fn with_color_temp(self, range: Option<(f64, f64)>) -> Self {
        let (min, max) = range.unwrap_or(COLOR_TEMP_RANGE);

        let mut feature = Expose::numeric("color_temp", Access::ALL)
            .with_unit("mired")
            .with_value_min(min)
            .with_value_max(max)
            .with_description("Color temperature of this light");

        let presets = [
            ("coolest", min, "Coolest temperature supported"),
            ("cool", 250., "Cool temperature (250 mireds / 4000 Kelvin)"),
            ("neutral", 370., "Neutral temperature (370 mireds / 2700 Kelvin)"),
            ("warm", 454., "Warm temperature (454 mireds / 2200 Kelvin)"),
            ("warmest", max, "Warmest temperature supported"),
        ];

        for (name, value, description) in presets {
            if (min..=max).contains(&value) {
                feature = feature.with_preset(name, value, description);
            }
        }

        self.with_preset_feature(PresetKind::Light, "with_color_temp", feature)
    }

    pub fn with_color_xy(self) -> Self {
        self.with_preset_feature(
            PresetKind::Light,
            "with_color_xy",
            Expose::composite("color_xy", "color", Access::ALL)
                .with_label("Color (X/Y)")
                .with_feature(Expose::numeric("x", Access::ALL))
                .with_feature(Expose::numeric("y", Access::ALL))
                .with_description("Color of this light in the CIE 1931 color space (x/y)"),
        )
    }

    pub fn with_level_config(self) -> Self {
        let level_config = Expose::composite("level_config", "level_config", Access::ALL)
            .with_feature(
                Expose::numeric("on_off_transition_time", Access::ALL)
                    .with_label("ON/OFF transition time")
                    .with_description("Time taken to move to or from the target level on on/off"),
            )
            .with_feature(
                Expose::binary("execute_if_off", Access::ALL, true, false)
                    .with_description("Whether level changes apply while the light is off"),
            )
            .with_feature(
                Expose::numeric("on_level", Access::ALL)
                    .with_value_min(1.)
                    .with_value_max(254.)
                    .with_preset("previous", 255, "Use previous value")
                    .with_description("Level applied when an on/toggle command turns the light on"),
            )
            .with_feature(
                Expose::numeric("current_level_startup", Access::ALL)
                    .with_value_min(1.)
                    .with_value_max(254.)
                    .with_preset("minimum", 0, "Use minimum permitted value")
                    .with_preset("previous", 255, "Use previous value")
                    .with_description("Startup level when the device is supplied with power"),
            )
            .with_description("Configure genLevelCtrl");

        self.with_preset_feature(PresetKind::Light, "with_level_config", level_config)
    }

    /// On/off state of a switch (`ON`/`OFF`/`TOGGLE`) or a lock (`LOCK`/`UNLOCK`)
    pub fn with_state(self, property: &str, description: &str) -> Self {
        let feature = match self.preset_kind() {
            Some(PresetKind::Switch) => Expose::binary("state", Access::ALL, "ON", "OFF")
                .with_value_toggle("TOGGLE"),
            Some(PresetKind::Lock) => Expose::binary("state", Access::ALL, "LOCK", "UNLOCK"),
            _ => {
                let mut this = self;
                this.misapplied("with_state");
                return this;
            }
        };

        self.with_feature(feature.with_property(property).with_description(description))
    }

    pub fn with_lock_state(self, property: &str, description: &str) -> Self {
        self.with_preset_feature(
            PresetKind::Lock,
            "with_lock_state",
            Expose::enumeration(
                "lock_state",
                Access::STATE,
                ["not_fully_locked", "locked", "unlocked"],
            )
            .with_property(property)
            .with_description(description),
        )
    }

    pub fn with_position(self) -> Self {
        self.with_preset_feature(
            PresetKind::Cover,
            "with_position",
            Expose::numeric("position", Access::ALL)
                .with_value_min(0.)
                .with_value_max(100.)
                .with_unit("%")
                .with_description("Position of this cover"),
        )
    }

    pub fn with_tilt(self) -> Self {
        self.with_preset_feature(
            PresetKind::Cover,
            "with_tilt",
            Expose::numeric("tilt", Access::ALL)
                .with_value_min(0.)
                .with_value_max(100.)
                .with_unit("%")
                .with_description("Tilt of this cover"),
        )
    }

    pub fn with_modes(self, modes: &[&str]) -> Self {
        self.with_preset_feature(
            PresetKind::Fan,
            "with_modes",
            Expose::enumeration("mode", Access::ALL, modes.iter().copied())
                .with_property("fan_mode")
                .with_description("Mode of this fan"),
        )
    }

    pub fn with_setpoint(self, property: &str, min: f64, max: f64, step: f64) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_setpoint",
            Expose::numeric(property, Access::ALL)
                .with_value_min(min)
                .with_value_max(max)
                .with_value_step(step)
                .with_unit("°C")
                .with_description("Temperature setpoint"),
        )
    }

    pub fn with_local_temperature(self) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_local_temperature",
            Expose::numeric("local_temperature", Access::STATE_GET)
                .with_unit("°C")
                .with_description("Current temperature measured on the device"),
        )
    }

    pub fn with_local_temperature_calibration(self, min: f64, max: f64, step: f64) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_local_temperature_calibration",
            Expose::numeric("local_temperature_calibration", Access::ALL)
                .with_value_min(min)
                .with_value_max(max)
                .with_value_step(step)
                .with_unit("°C")
                .with_description("Offset to add/subtract to the local temperature"),
        )
    }

    pub fn with_system_mode(self, modes: &[&str]) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_system_mode",
            Expose::enumeration("system_mode", Access::ALL, modes.iter().copied())
                .with_description("Mode of this device"),
        )
    }

    pub fn with_running_state(self, states: &[&str]) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_running_state",
            Expose::enumeration("running_state", Access::STATE_GET, states.iter().copied())
                .with_description("The current running state"),
        )
    }

    pub fn with_fan_mode(self, modes: &[&str]) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_fan_mode",
            Expose::enumeration("fan_mode", Access::ALL, modes.iter().copied())
                .with_description("Mode of the fan"),
        )
    }

    pub fn with_pi_heating_demand(self) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_pi_heating_demand",
            Expose::numeric("pi_heating_demand", Access::STATE)
                .with_label("PI heating demand")
                .with_value_min(0.)
                .with_value_max(100.)
                .with_unit("%")
                .with_description("Position of the valve (= demanded heat), 0% is fully closed"),
        )
    }

    /// Named device mode, similar to `system_mode`
    pub fn with_preset_modes(self, modes: &[&str]) -> Self {
        self.with_preset_feature(
            PresetKind::Climate,
            "with_preset_modes",
            Expose::enumeration("preset", Access::STATE_SET, modes.iter().copied())
                .with_description("Mode of this device (similar to system_mode)"),
        )
    }

    fn preset_kind(&self) -> Option<PresetKind> {
        match self.kind {
            ExposeKind::Preset { preset, .. } => Some(preset),
            _ => None,
        }
    }

    fn with_preset_feature(mut self, kind: PresetKind, method: &'static str, feature: Expose) -> Self {
        if self.preset_kind() == Some(kind) {
            self.with_feature(feature)
        } else {
            self.misapplied(method);
            self
        }
    }
}

/// Vocabulary rules of the standardized presets
pub(crate) fn check_preset(preset: PresetKind, features: &[Expose]) -> Result<(), ExposeError> {
    if preset != PresetKind::Climate {
        return Ok(());
    }

    for feature in features {
        let allowed = match feature.name.as_str() {
            name if name.ends_with("_setpoint") => {
                if !SETPOINTS.contains(&name) {
                    return Err(ExposeError::NotAllowed {
                        name: feature.name.clone(),
                        value: feature.name.clone(),
                        preset,
                    });
                }
                continue;
            }
            "system_mode" => SYSTEM_MODES,
            "running_state" => RUNNING_STATES,
            "fan_mode" => FAN_MODES,
            _ => continue,
        };

        if let ExposeKind::Enum(enumeration) = &feature.kind
            && let Some(value) = enumeration.values.iter().find(|v| !allowed.contains(&v.as_str()))
        {
            return Err(ExposeError::NotAllowed {
                name: feature.name.clone(),
                value: value.clone(),
                preset,
            });
        }
    }

    Ok(())
}
