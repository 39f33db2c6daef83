use std::sync::{Arc, Mutex};

use crate::listener::ListenerSet;
use crate::method::MethodDesc;

/// A named, class-bound entity exposing methods and parameters under
/// its OSC path. Modules own their object for their whole running
/// phase; the namespace and server only hold shared handles.
pub struct Object {
    name: String,
    desc: String,
    path: Mutex<String>,
    pub listeners: ListenerSet,
    methods: Mutex<Vec<Arc<MethodDesc>>>,
    params: Mutex<Vec<Arc<MethodDesc>>>,
}

impl Object {
    pub fn new(name: impl Into<String>, desc: impl Into<String>) -> Arc<Object> {
        Arc::new(Object {
            name: name.into(),
            desc: desc.into(),
            path: Mutex::new(String::new()),
            listeners: ListenerSet::default(),
            methods: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.desc
    }

    /// Absolute OSC path, `<root>/<class>/<name>`. Empty until the
    /// object is registered with its class.
    pub fn path(&self) -> String {
        self.path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_path(&self, path: String) {
        *self
            .path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = path;
    }

    pub(crate) fn record_method(&self, desc: Arc<MethodDesc>) {
        self.methods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(desc);
    }

    pub(crate) fn record_param(&self, desc: Arc<MethodDesc>) {
        self.params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(desc);
    }

    pub(crate) fn clear_descriptors(&self) {
        self.methods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn methods(&self) -> Vec<Arc<MethodDesc>> {
        self.methods
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn params(&self) -> Vec<Arc<MethodDesc>> {
        self.params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
