use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::object::Object;

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("class '{0}' already exists")]
    ClassExists(String),

    #[error("class '{0}' still has objects attached")]
    ClassNotEmpty(String),

    #[error("unknown class '{0}'")]
    UnknownClass(String),
}

/// A container of objects carrying the OSC path prefix for its members.
pub struct Class {
    name: String,
    classpath: String,
    objects: Mutex<Vec<Arc<Object>>>,
}

impl Class {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classpath(&self) -> &str {
        &self.classpath
    }

    pub fn objects(&self) -> Vec<Arc<Object>> {
        lock(&self.objects).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The class/object tree under the OSC root. Built single-threaded at
/// startup; later mutation (a lazy module load) is serialized by the
/// caller.
pub struct Namespace {
    root: String,
    classes: Mutex<Vec<Arc<Class>>>,
}

impl Namespace {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            classes: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Creates and registers a class, giving it the path
    /// `<root>/<name>`. Class names are unique case-insensitively.
    pub fn register_class(&self, name: &str) -> Result<Arc<Class>, NamespaceError> {
        if self.find_class(name).is_some() {
            warn!("class '{name}' already exists");
            return Err(NamespaceError::ClassExists(name.to_string()));
        }

        info!("registering class '{name}'");
        let class = Arc::new(Class {
            name: name.to_string(),
            classpath: format!("{}/{}", self.root, name),
            objects: Mutex::new(Vec::new()),
        });
        lock(&self.classes).push(class.clone());
        Ok(class)
    }

    /// A class refuses to go away while it still has objects.
    pub fn deregister_class(&self, class: &Arc<Class>) -> Result<(), NamespaceError> {
        if !class.is_empty() {
            return Err(NamespaceError::ClassNotEmpty(class.name.clone()));
        }
        lock(&self.classes).retain(|c| !Arc::ptr_eq(c, class));
        Ok(())
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<Class>> {
        lock(&self.classes)
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Binds an object to a class and computes its absolute path.
    pub fn register_object(&self, object: &Arc<Object>, class: &Arc<Class>) {
        object.set_path(format!("{}/{}", class.classpath, object.name()));
        lock(&class.objects).push(object.clone());
    }

    /// Detaches an object from whichever class holds it. Does not
    /// release anything the object owns.
    pub fn deregister_object(&self, object: &Arc<Object>) {
        for class in lock(&self.classes).iter() {
            lock(&class.objects).retain(|o| !Arc::ptr_eq(o, object));
        }
    }

    pub fn classes(&self) -> Vec<Arc<Class>> {
        lock(&self.classes).clone()
    }
}
