pub mod plugin;
pub mod template;
pub mod typefuzz;

use std::collections::BTreeMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::config::FuzzerConfig;
use crate::error::{EngineError, EngineResult};
use crate::fuzzers::plugin::FuzzerPlugin;
use crate::fuzzers::template::{FuzzerProfile, TemplateFuzzer};

lazy_static! {
    static ref BUILTIN: BTreeMap<&'static str, fn() -> FuzzerProfile> = {
        let mut builtin: BTreeMap<&'static str, fn() -> FuzzerProfile> = BTreeMap::new();
        builtin.insert("typefuzz", typefuzz::profile);
        builtin
    };
}

/// Names of the compiled-in fuzzers.
pub fn builtin_names() -> Vec<String> {
    BUILTIN.keys().map(|name| name.to_string()).collect()
}

/// Resolve a fuzzer by name, once, at startup.
///
/// A built-in profile is overlaid with the fuzzer's `fuzzer.json` if one was
/// found. Unknown names are accepted only when their `fuzzer.json` describes
/// a complete command template.
pub fn get_fuzzer(name: &str, config: Option<&FuzzerConfig>) -> EngineResult<Arc<dyn FuzzerPlugin>> {
    let base = match (BUILTIN.get(name), config) {
        (Some(builtin), _) => builtin(),
        (None, Some(cfg)) if cfg.defines_command() => FuzzerProfile::bare(name),
        _ => {
            return Err(EngineError::PluginLoad {
                name: name.to_string(),
                available: builtin_names(),
            });
        }
    };
    let profile = match config {
        Some(cfg) => cfg.overlay(base),
        None => base,
    };
    if profile.command.is_empty() {
        return Err(EngineError::Configuration(format!(
            "fuzzer {name:?} has an empty command template"
        )));
    }
    Ok(Arc::new(TemplateFuzzer::new(profile)))
}
