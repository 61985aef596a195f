//! Input plugins
//!
//! Every `[[inputs.<name>]]` table in the managed section becomes one
//! [`Input`] instance. Plugins are looked up in a static registry; a name the
//! registry does not know is a configuration error, which is what makes a
//! candidate with a typo in a plugin name fail validation.

use crate::metrics::Metric;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

mod cpu;
mod disk;
mod mem;
mod system;

/// A source of metrics
pub trait Input: Send {
    /// Plugin name as written in `[[inputs.<name>]]`
    fn name(&self) -> &'static str;

    /// Collect one round of metrics
    fn gather(&mut self) -> Result<Vec<Metric>>;
}

type InputFactory = fn(&toml::Value) -> Result<Box<dyn Input>>;

static INPUT_REGISTRY: Lazy<BTreeMap<&'static str, InputFactory>> = Lazy::new(|| {
    let mut registry: BTreeMap<&'static str, InputFactory> = BTreeMap::new();
    registry.insert("cpu", cpu::create);
    registry.insert("disk", disk::create);
    registry.insert("mem", mem::create);
    registry.insert("system", system::create);
    registry
});

/// Lookup table of built-in input plugins
pub struct InputRegistry;

impl InputRegistry {
    /// Names of all registered plugins, sorted
    pub fn registered_inputs() -> Vec<&'static str> {
        INPUT_REGISTRY.keys().copied().collect()
    }

    /// Build one plugin instance from its options table
    pub fn build(name: &str, options: &toml::Value) -> Result<Box<dyn Input>> {
        let factory = INPUT_REGISTRY.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown input plugin '{}' (available: {})",
                name,
                Self::registered_inputs().join(", ")
            )
        })?;
        factory(options).with_context(|| format!("invalid options for input plugin '{}'", name))
    }
}

/// Build every configured input, failing on the first invalid one
pub fn build_inputs(inputs: &BTreeMap<String, Vec<toml::Value>>) -> Result<Vec<Box<dyn Input>>> {
    let mut built = Vec::new();
    for (name, instances) in inputs {
        for options in instances {
            built.push(InputRegistry::build(name, options)?);
        }
    }
    Ok(built)
}

pub(crate) fn parse_options<T: DeserializeOwned>(options: &toml::Value) -> Result<T> {
    Ok(options.clone().try_into()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> toml::Value {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn test_registered_inputs() {
        assert_eq!(
            InputRegistry::registered_inputs(),
            vec!["cpu", "disk", "mem", "system"]
        );
    }

    #[test]
    fn test_unknown_input_is_error() {
        let err = InputRegistry::build("cpuu", &table("")).err().unwrap();
        let message = format!("{:#}", err);
        assert!(message.contains("unknown input plugin 'cpuu'"));
        assert!(message.contains("cpu, disk, mem, system"));
    }

    #[test]
    fn test_unknown_option_is_error() {
        let err = InputRegistry::build("mem", &table("bogus = 1")).err().unwrap();
        assert!(format!("{:#}", err).contains("invalid options for input plugin 'mem'"));
    }

    #[test]
    fn test_build_inputs_counts_instances() {
        let mut inputs = BTreeMap::new();
        inputs.insert("cpu".to_string(), vec![table(""), table("percpu = false")]);
        inputs.insert("mem".to_string(), vec![table("")]);

        let built = build_inputs(&inputs).unwrap();
        let names: Vec<_> = built.iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["cpu", "cpu", "mem"]);
    }
}
