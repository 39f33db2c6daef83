use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use sios_config::ModuleConfig;
use sios_osc::{Class, Object};

use crate::module::{Module, ModuleCtx, ModuleError, ModuleSpec, Platform};
use crate::params::ParamError;
use crate::version::{version_string, PLATFORM_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("'{0}' already loaded")]
    Duplicate(String),

    #[error("no module artifact '{0}'")]
    NoArtifact(String),

    #[error("module version mismatch, {module} has platform version {have}, should be {want}")]
    VersionMismatch {
        module: String,
        have: String,
        want: String,
    },

    #[error("error setting parameter '{name}' of '{module}'")]
    Param {
        module: String,
        name: String,
        #[source]
        source: ParamError,
    },

    #[error("error initializing '{module}'")]
    Init {
        module: String,
        #[source]
        source: ModuleError,
    },

    #[error("module '{0}' produced no object")]
    NoObject(String),

    #[error("no lazy module with id '{0}'")]
    UnknownLazyId(String),
}

/// A module record parsed from configuration, waiting to be loaded.
struct StagedModule {
    basename: String,
    path: String,
    descr: String,
    lazy_id: String,
    class: Arc<Class>,
    params: Vec<(String, String)>,
}

/// A module that made it through init.
pub struct LoadedModule {
    basename: String,
    path: String,
    descr: String,
    version: u32,
    version_str: &'static str,
    class: Arc<Class>,
    module: Box<dyn Module>,
    object: Arc<Object>,
}

impl LoadedModule {
    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn description(&self) -> &str {
        &self.descr
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn version_str(&self) -> &str {
        self.version_str
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }
}

/// Stages module records from configuration and drives them through
/// the load sequence: artifact lookup, version gate, parameter
/// injection, init, object binding. Lazy records wait in their own
/// bucket until something triggers them by id.
pub struct ModuleLoader {
    available: Vec<ModuleSpec>,
    strict_versioning: bool,
    eager: Mutex<Vec<StagedModule>>,
    lazy: Mutex<Vec<StagedModule>>,
    loaded: Mutex<Vec<LoadedModule>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ModuleLoader {
    pub fn new(available: Vec<ModuleSpec>, strict_versioning: bool) -> Self {
        Self {
            available,
            strict_versioning,
            eager: Mutex::new(Vec::new()),
            lazy: Mutex::new(Vec::new()),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Stages one configured module into the eager or lazy bucket.
    /// Basenames are unique across both buckets and the loaded list.
    pub fn stage(&self, config: &ModuleConfig, class: Arc<Class>) -> Result<(), LoadError> {
        let basename = Path::new(&config.module_path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&config.module_path)
            .to_string();

        if self.knows(&basename) {
            warn!("'{basename}' already loaded");
            return Err(LoadError::Duplicate(basename));
        }

        let staged = StagedModule {
            lazy_id: config
                .lazy_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| basename.clone()),
            basename,
            path: config.module_path.clone(),
            descr: config.module_description.clone(),
            class,
            params: config
                .params
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        };

        if config.module_is_lazy {
            lock(&self.lazy).push(staged);
        } else {
            lock(&self.eager).push(staged);
        }
        Ok(())
    }

    fn knows(&self, basename: &str) -> bool {
        lock(&self.eager).iter().any(|m| m.basename == basename)
            || lock(&self.lazy).iter().any(|m| m.basename == basename)
            || lock(&self.loaded).iter().any(|m| m.basename == basename)
    }

    /// Loads every staged eager module. Failures are isolated to the
    /// offending module; the count of failures is returned.
    pub fn load_all(&self, platform: &Platform) -> usize {
        let staged: Vec<StagedModule> = lock(&self.eager).drain(..).collect();
        let mut failures = 0;
        for module in staged {
            let basename = module.basename.clone();
            if let Err(err) = self.load_one(module, platform) {
                warn!("error loading module '{basename}': {err}");
                failures += 1;
            }
        }
        failures
    }

    /// Loads a staged lazy module by its trigger id.
    pub fn trigger(&self, id: &str, platform: &Platform) -> Result<(), LoadError> {
        let staged = {
            let mut lazy = lock(&self.lazy);
            let pos = lazy
                .iter()
                .position(|m| m.lazy_id == id)
                .ok_or_else(|| LoadError::UnknownLazyId(id.to_string()))?;
            lazy.remove(pos)
        };
        let basename = staged.basename.clone();
        self.load_one(staged, platform).inspect_err(|err| {
            warn!("error loading lazy module '{basename}': {err}");
        })
    }

    fn load_one(&self, staged: StagedModule, platform: &Platform) -> Result<(), LoadError> {
        let spec = self
            .available
            .iter()
            .find(|spec| spec.basename == staged.basename)
            .ok_or_else(|| LoadError::NoArtifact(staged.basename.clone()))?;

        if spec.platform_version != PLATFORM_VERSION {
            if self.strict_versioning {
                return Err(LoadError::VersionMismatch {
                    module: staged.basename,
                    have: version_string(spec.platform_version),
                    want: version_string(PLATFORM_VERSION),
                });
            }
            warn!(
                "module version mismatch, {} has platform version {}, should be {}",
                staged.basename,
                version_string(spec.platform_version),
                version_string(PLATFORM_VERSION)
            );
        }

        info!(
            "loading module '{}' version {}",
            staged.basename, spec.version_str
        );

        let mut module = (spec.ctor)();

        for (name, value) in &staged.params {
            module
                .set_param(name, value)
                .map_err(|source| LoadError::Param {
                    module: staged.basename.clone(),
                    name: name.clone(),
                    source,
                })?;
        }

        let ctx = ModuleCtx {
            name: staged.basename.clone(),
            description: staged.descr.clone(),
            class: staged.class.clone(),
        };

        // An init failure unloads the module without calling exit.
        module
            .init(platform, &ctx)
            .map_err(|source| LoadError::Init {
                module: staged.basename.clone(),
                source,
            })?;

        let object = module
            .object()
            .ok_or_else(|| LoadError::NoObject(staged.basename.clone()))?;

        lock(&self.loaded).push(LoadedModule {
            basename: staged.basename,
            path: staged.path,
            descr: staged.descr,
            version: spec.version,
            version_str: spec.version_str,
            class: staged.class,
            module,
            object,
        });
        Ok(())
    }

    pub fn is_loaded(&self, basename: &str) -> bool {
        lock(&self.loaded).iter().any(|m| m.basename == basename)
    }

    /// Runs `f` over the loaded module records (introspection dumps,
    /// status queries).
    pub fn with_loaded<R>(&self, f: impl FnOnce(&[LoadedModule]) -> R) -> R {
        f(&lock(&self.loaded))
    }

    /// Calls every loaded module's exit hook and empties the list.
    pub fn unload_all(&self, platform: &Platform) {
        let mut modules: Vec<LoadedModule> = lock(&self.loaded).drain(..).collect();
        for loaded in modules.iter_mut() {
            info!("unloading module '{}'", loaded.basename);
            loaded.module.exit(platform);
        }
    }
}
