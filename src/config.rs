//! # Configuration loading
//!
//! Settings come from up to two layers, later ones winning:
//!
//! 1. a TOML file (`--config`)
//! 2. environment variables with a prefix, `__` separating nested keys
//!    (`TRACEHOP_SERVICE__LISTEN_ADDR=0.0.0.0:8082`)
//!
//! After merging, string values of the form `${VAR}` or `$VAR` are replaced with the value of
//! that environment variable, so secrets and per-host values can stay out of the file.
//!
//! [`write_sample`] renders a commented sample file from the settings' doc comments via
//! [doku](https://docs.rs/doku).

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format as _, Toml},
    value::{Dict, Map, Value},
    Figment, Metadata, Profile, Provider,
};
use serde::de::DeserializeOwned;
use snafu::ResultExt as _;

use crate::{ConfigFileReadSnafu, ConfigFileWriteSnafu, ConfigLoadSnafu, Error};

/// Expand a `${VAR}` or `$VAR` reference.
///
/// Unset variables and values without a leading `$` come back unchanged.
///
/// ```
/// use tracehop::config::expand_env_var;
///
/// assert_eq!(expand_env_var("http://collector:4317"), "http://collector:4317");
/// assert_eq!(expand_env_var("${TRACEHOP_DOC_SURELY_UNSET}"), "${TRACEHOP_DOC_SURELY_UNSET}");
/// ```
pub fn expand_env_var(value: &str) -> String {
    let var_name = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .or_else(|| value.strip_prefix('$'));

    match var_name {
        Some(var_name) => std::env::var(var_name).unwrap_or_else(|_| value.to_owned()),
        None => value.to_owned(),
    }
}

fn expand_value(value: Value) -> Value {
    match value {
        Value::String(tag, s) => Value::String(tag, expand_env_var(&s)),
        Value::Dict(tag, dict) => Value::Dict(tag, expand_dict(dict)),
        Value::Array(tag, items) => Value::Array(tag, items.into_iter().map(expand_value).collect()),
        other => other,
    }
}

fn expand_dict(dict: Dict) -> Dict {
    dict.into_iter()
        .map(|(key, value)| (key, expand_value(value)))
        .collect()
}

/// Figment provider serving already-merged data with env references expanded.
struct Expanded {
    data: Map<Profile, Dict>,
}

impl Expanded {
    fn from_figment(figment: &Figment) -> Result<Self, figment::Error> {
        let data = figment
            .data()?
            .into_iter()
            .map(|(profile, dict)| (profile, expand_dict(dict)))
            .collect();
        Ok(Self { data })
    }
}

impl Provider for Expanded {
    fn metadata(&self) -> Metadata {
        Metadata::named("env-expanded")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(self.data.clone())
    }
}

/// Write a commented sample config for `C` to `path`.
///
/// # Errors
/// - `ConfigFileWrite` if the file cannot be written.
pub fn write_sample<C>(path: impl Into<PathBuf>) -> Result<(), Error>
where
    C: doku::Document,
{
    let path = path.into();
    std::fs::write(&path, doku::to_toml::<C>()).context(ConfigFileWriteSnafu { path })
}

/// Load `C` from an optional TOML file, environment overrides and env references.
///
/// # Errors
/// - `ConfigFileRead` if the file cannot be read.
/// - `ConfigLoad` if the file is malformed or the merged values do not fit `C`.
#[allow(tail_expr_drop_order)]
pub fn load<C, P>(config_path: Option<P>, env_prefix: Option<&str>) -> Result<C, Error>
where
    C: DeserializeOwned,
    P: AsRef<Path>,
{
    let mut figment = Figment::new();

    if let Some(config_path) = config_path {
        let path = config_path.as_ref();
        let contents = std::fs::read_to_string(path).context(ConfigFileReadSnafu { path })?;
        figment = figment.merge(Toml::string(&contents));
    }

    if let Some(env_prefix) = env_prefix {
        figment = figment.merge(Env::prefixed(env_prefix).split("__"));
    }

    let expanded = Expanded::from_figment(&figment).context(ConfigLoadSnafu)?;
    Figment::from(expanded).extract().context(ConfigLoadSnafu)
}
