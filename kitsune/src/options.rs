//! Layered device options and the numeric post-processing they drive

use serde_json::Value;

/// Free-form option map; values are whatever the user or the device class configured
pub type Options = serde_json::Map<String, Value>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OptionsError {
    #[error("option {key:?} is not a number, got {value}")]
    NotANumber { key: String, value: Value },
}

/// Properties whose calibration is a percentage of the measured value rather than an offset
const PERCENTUAL: &[&str] = &["current", "energy", "voltage", "power", "illuminance"];

const DEFAULT_PRECISION: &[(&str, i32)] = &[
    ("temperature", 2),
    ("humidity", 2),
    ("pressure", 1),
    ("pm25", 0),
    ("power", 2),
    ("current", 2),
    ("current_phase_b", 2),
    ("current_phase_c", 2),
    ("voltage", 2),
    ("voltage_phase_b", 2),
    ("voltage_phase_c", 2),
    ("power_phase_b", 2),
    ("power_phase_c", 2),
    ("energy", 2),
    ("device_temperature", 0),
    ("soil_moisture", 2),
    ("co2", 0),
    ("illuminance", 0),
    ("illuminance_lux", 0),
    ("voc", 0),
    ("formaldehyd", 0),
    ("co", 0),
];

/// Shallow merge of option layers, lowest priority first
pub fn merge_options<'a>(layers: impl IntoIterator<Item = &'a Options>) -> Options {
    let mut merged = Options::new();

    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

/// Reads a numeric option, accepting numbers and numeric strings
pub fn number(options: &Options, key: &str) -> Result<Option<f64>, OptionsError> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };

    parsed.map(Some).ok_or_else(|| OptionsError::NotANumber {
        key: key.to_owned(),
        value: value.clone(),
    })
}

pub fn precision_round(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

/// Applies `<property>_calibration` and `<property>_precision` from `options` to a reading
pub fn calibrate_and_round(
    value: f64,
    options: &Options,
    property: &str,
) -> Result<f64, OptionsError> {
    let mut offset = number(options, &format!("{property}_calibration"))?.unwrap_or(0.);
    if PERCENTUAL.iter().any(|p| property.starts_with(p)) {
        offset = value * offset / 100.;
    }

    let default = DEFAULT_PRECISION
        .iter()
        .find(|(name, _)| *name == property)
        .map_or(0, |(_, precision)| *precision);

    let precision = match number(options, &format!("{property}_precision"))? {
        Some(precision) => precision as i32,
        None => default,
    };

    Ok(precision_round(value + offset, precision))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn options(value: Value) -> Options {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn layers_override_shallowly() {
        let defaults = options(json!({ "transition": 0, "color_sync": true }));
        let meta = options(json!({ "transition": 1 }));
        let user = options(json!({ "color_sync": false, "temperature_precision": 1 }));

        assert_eq!(
            Value::Object(merge_options([&defaults, &meta, &user])),
            json!({ "transition": 1, "color_sync": false, "temperature_precision": 1 })
        );
    }

    #[test]
    fn calibration() {
        let none = Options::new();
        assert_eq!(calibrate_and_round(21.456, &none, "temperature").unwrap(), 21.46);
        assert_eq!(calibrate_and_round(512.6, &none, "illuminance").unwrap(), 513.);

        let offset = options(json!({ "temperature_calibration": -1.5, "temperature_precision": 1 }));
        assert_eq!(calibrate_and_round(21.46, &offset, "temperature").unwrap(), 20.);

        let percent = options(json!({ "power_calibration": "10" }));
        assert_eq!(calibrate_and_round(100., &percent, "power").unwrap(), 110.);
    }

    #[test]
    fn calibration_rejects_garbage() {
        let bad = options(json!({ "humidity_calibration": "lots" }));
        assert_eq!(
            calibrate_and_round(40., &bad, "humidity"),
            Err(OptionsError::NotANumber {
                key: "humidity_calibration".to_owned(),
                value: json!("lots"),
            })
        );
    }
}
