//! Key/value configuration stores with change notification

use config::Source;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{ForwarderError, Result};

/// Callback invoked after any configuration key changes
pub type ConfigObserver = Arc<dyn Fn() + Send + Sync>;

/// A key/value configuration store that can notify about changes
pub trait ConfigStore: Send + Sync + 'static {
    /// Raw value of a key, if set
    fn get_value(&self, key: &str) -> Option<String>;

    /// Register an observer under a name, replacing any previous one with that name
    fn subscribe(&self, name: &str, observer: ConfigObserver);

    /// Remove the observer registered under a name
    fn unsubscribe(&self, name: &str);

    /// Trimmed value of a key; blank values count as unset
    fn get_opt_string(&self, key: &str) -> Option<String> {
        self.get_value(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get_opt_string(key)
            .unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        parse_or_default(key, self.get_opt_string(key), default, parse_bool)
    }

    fn get_u16(&self, key: &str, default: u16) -> u16 {
        parse_or_default(key, self.get_opt_string(key), default, |raw| raw.parse().ok())
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        parse_or_default(key, self.get_opt_string(key), default, |raw| raw.parse().ok())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_or_default<T: Display>(
    key: &str,
    raw: Option<String>,
    default: T,
    parse: impl FnOnce(&str) -> Option<T>,
) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match parse(&raw) {
        Some(value) => value,
        None => {
            warn!(
                "Config error: invalid value '{}' for {}, using default {}",
                raw, key, default
            );
            default
        }
    }
}

/// Named observers shared by the store implementations
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<(String, ConfigObserver)>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a named observer
    pub fn put(&self, name: &str, observer: ConfigObserver) {
        let Ok(mut observers) = self.observers.write() else {
            error!("Observer list lock poisoned, dropping observer {}", name);
            return;
        };
        match observers.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = observer,
            None => observers.push((name.to_string(), observer)),
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut observers) = self.observers.write() {
            observers.retain(|(n, _)| n != name);
        }
    }

    /// Call every observer; the list is not locked while observers run
    pub fn notify(&self) {
        let snapshot: Vec<(String, ConfigObserver)> = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => {
                error!("Observer list lock poisoned, skipping change notification");
                return;
            }
        };

        for (name, observer) in snapshot {
            trace!("Notifying configuration observer {}", name);
            observer();
        }
    }
}

/// An in-process configuration store
#[derive(Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, String>>,
    observers: ObserverList,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key; observers are not notified until [`notify_changed`](Self::notify_changed)
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.into(), value.into());
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }

    /// Tell observers that one or more keys changed
    pub fn notify_changed(&self) {
        self.observers.notify();
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_value(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn subscribe(&self, name: &str, observer: ConfigObserver) {
        self.observers.put(name, observer);
    }

    fn unsubscribe(&self, name: &str) {
        self.observers.remove(name);
    }
}

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path; format chosen by extension (toml, json, yaml)
    File(String),
    /// Environment variables with a prefix
    Environment(String),
    /// TOML string
    Toml(String),
}

fn file_format(path: &Path) -> Result<config::FileFormat> {
    let extension = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => {
            return Err(ForwarderError::Config(format!(
                "Configuration file has no extension: {}",
                path.display()
            )));
        }
    };

    match extension.as_str() {
        "toml" => Ok(config::FileFormat::Toml),
        "json" => Ok(config::FileFormat::Json),
        "yaml" | "yml" => Ok(config::FileFormat::Yaml),
        format => Err(ForwarderError::Config(format!(
            "Unsupported config format: {}",
            format
        ))),
    }
}

/// Merge the sources in order and flatten scalar keys into strings
fn load_values(sources: &[ConfigSource]) -> Result<HashMap<String, String>> {
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                let file_path = Path::new(path);
                if !file_path.exists() {
                    return Err(ForwarderError::Config(format!(
                        "Configuration file not found: {}",
                        file_path.display()
                    )));
                }
                let format = file_format(file_path)?;
                debug!("Loading configuration from file: {}", file_path.display());
                builder = builder.add_source(config::File::with_name(path).format(format));
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(
                    config::Environment::with_prefix(prefix)
                        .separator("__")
                        .try_parsing(true),
                );
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder.add_source(config::File::from_str(
                    toml_str,
                    config::FileFormat::Toml,
                ));
            }
        }
    }

    let table = builder.build()?.collect()?;

    let mut values = HashMap::with_capacity(table.len());
    for (key, value) in table {
        match value.into_string() {
            Ok(value) => {
                values.insert(key, value);
            }
            Err(_) => debug!("Ignoring non-scalar configuration key {}", key),
        }
    }
    Ok(values)
}

/// A configuration store backed by files and environment variables
pub struct FileConfigStore {
    sources: Vec<ConfigSource>,
    values: RwLock<HashMap<String, String>>,
    observers: ObserverList,
    watching: AtomicBool,
}

impl FileConfigStore {
    /// Load the sources; later sources override earlier ones
    pub fn load(sources: Vec<ConfigSource>) -> Result<Self> {
        let values = load_values(&sources)?;
        debug!("Loaded {} configuration keys", values.len());

        Ok(Self {
            sources,
            values: RwLock::new(values),
            observers: ObserverList::new(),
            watching: AtomicBool::new(false),
        })
    }

    /// Re-read the sources and notify observers if anything changed
    ///
    /// Returns whether a change was detected. On error the previous values
    /// are kept.
    pub fn reload(&self) -> Result<bool> {
        let next = load_values(&self.sources)?;

        {
            let mut values = self
                .values
                .write()
                .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
            if *values == next {
                return Ok(false);
            }
            *values = next;
        }

        self.observers.notify();
        Ok(true)
    }

    /// Poll the sources for changes in a background task
    pub fn watch(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        self.watching.store(true, Ordering::Relaxed);
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            // The first tick completes immediately
            timer.tick().await;

            info!("Watching configuration for changes every {:?}", every);

            while store.watching.load(Ordering::Relaxed) {
                timer.tick().await;
                if !store.watching.load(Ordering::Relaxed) {
                    break;
                }

                match store.reload() {
                    Ok(true) => info!("Configuration changed"),
                    Ok(false) => trace!("Configuration unchanged"),
                    Err(e) => warn!("Failed to reload configuration: {}", e),
                }
            }

            debug!("Stopped watching configuration");
        })
    }

    /// Stop a watcher started with [`watch`](Self::watch)
    pub fn stop(&self) {
        self.watching.store(false, Ordering::Relaxed);
    }
}

impl ConfigStore for FileConfigStore {
    fn get_value(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn subscribe(&self, name: &str, observer: ConfigObserver) {
        self.observers.put(name, observer);
    }

    fn unsubscribe(&self, name: &str) {
        self.observers.remove(name);
    }
}
