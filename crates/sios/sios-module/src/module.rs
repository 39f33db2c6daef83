use std::io;
use std::sync::Arc;

use sios_core::SourceRegistry;
use sios_osc::{Class, Namespace, Object, OscServer, ServerError};

use crate::params::ParamError;

/// The platform handles a module works against: the source registry
/// for its fd/timer sources, the OSC server for its methods and
/// outbound data, and the namespace its object registers into.
#[derive(Clone)]
pub struct Platform {
    pub sources: Arc<SourceRegistry>,
    pub osc: Arc<OscServer>,
    pub namespace: Arc<Namespace>,
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("error opening device '{device}'")]
    Device {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Osc(#[from] ServerError),

    #[error("{0}")]
    Failed(String),
}

/// Identity the loader injects before init: the object name (the
/// module basename), the configured description, and the class the
/// module's object belongs to.
pub struct ModuleCtx {
    pub name: String,
    pub description: String,
    pub class: Arc<Class>,
}

/// One driver module. The loader constructs it from its
/// [`ModuleSpec`], applies config parameters, then calls `init`;
/// `exit` must remove the module's sources, close its devices and
/// deregister its object.
pub trait Module: Send {
    /// Applies one configured parameter. Called before `init`; any
    /// failure aborts the module's initialization.
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), ParamError>;

    fn init(&mut self, platform: &Platform, ctx: &ModuleCtx) -> Result<(), ModuleError>;

    fn exit(&mut self, platform: &Platform);

    /// The object this module produced; available after a successful
    /// `init`.
    fn object(&self) -> Option<Arc<Object>>;
}

/// A statically linked module artifact: what the dynamic loader used
/// to find via well-known symbols, as plain data plus a constructor.
/// The configured module path selects a spec by basename.
pub struct ModuleSpec {
    pub basename: &'static str,
    pub version: u32,
    pub version_str: &'static str,
    /// The platform version this module was built against; checked on
    /// load, fatally so in strict mode.
    pub platform_version: u32,
    pub ctor: fn() -> Box<dyn Module>,
}
