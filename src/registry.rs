use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{ForwarderError, Result};

/// Type information used to tag every point of a monitored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object type (e.g. "tomcat")
    pub object_type: String,
    /// Family the object type belongs to (e.g. "javaee")
    pub object_family: String,
}

/// Lookup of object type and family by object name
pub trait ObjectRegistry: Send + Sync + 'static {
    /// Resolve the type and family of the named object
    fn lookup(&self, object_name: &str) -> Result<ObjectInfo>;
}

/// Serialized form of a [`StaticRegistry`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySnapshot {
    /// Object name to object type
    #[serde(default)]
    pub objects: HashMap<String, String>,
    /// Object type to family name
    #[serde(default)]
    pub families: HashMap<String, String>,
}

/// In-memory registry of known objects and the families of their types
pub struct StaticRegistry {
    objects: RwLock<HashMap<String, String>>,
    families: RwLock<HashMap<String, String>>,
}

impl StaticRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            families: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            objects: RwLock::new(snapshot.objects),
            families: RwLock::new(snapshot.families),
        }
    }

    /// Load a registry from a JSON snapshot file
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading object registry from {}", path.display());

        let contents = std::fs::read_to_string(path)?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&contents).map_err(|e| {
            ForwarderError::Config(format!("Invalid registry file {}: {}", path.display(), e))
        })?;

        debug!(
            "Loaded {} objects and {} families",
            snapshot.objects.len(),
            snapshot.families.len()
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Register (or re-register) an object under the given type
    pub fn register_object(&self, object_name: impl Into<String>, object_type: impl Into<String>) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        objects.insert(object_name.into(), object_type.into());
        Ok(())
    }

    /// Register the family an object type belongs to
    pub fn register_family(&self, object_type: impl Into<String>, family: impl Into<String>) -> Result<()> {
        let mut families = self
            .families
            .write()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        families.insert(object_type.into(), family.into());
        Ok(())
    }

    /// Forget an object
    pub fn remove_object(&self, object_name: &str) -> Result<Option<String>> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        Ok(objects.remove(object_name))
    }

    /// Count the number of registered objects
    pub fn count(&self) -> Result<usize> {
        let objects = self
            .objects
            .read()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        Ok(objects.len())
    }
}

impl ObjectRegistry for StaticRegistry {
    fn lookup(&self, object_name: &str) -> Result<ObjectInfo> {
        let objects = self
            .objects
            .read()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        let object_type = objects
            .get(object_name)
            .cloned()
            .ok_or_else(|| ForwarderError::Lookup(format!("Unknown object '{}'", object_name)))?;
        drop(objects);

        let families = self
            .families
            .read()
            .map_err(|_| ForwarderError::Other("Lock poisoned".to_string()))?;
        let object_family = families.get(&object_type).cloned().ok_or_else(|| {
            ForwarderError::Lookup(format!(
                "No family for object type '{}' of object '{}'",
                object_type, object_name
            ))
        })?;

        Ok(ObjectInfo {
            object_type,
            object_family,
        })
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}
