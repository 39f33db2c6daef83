//! Module lifecycle: the statically linked module registry, parameter
//! injection, the load/unload sequence and the optional XML
//! introspection dumps.

pub mod loader;
pub mod module;
pub mod params;
pub mod version;
pub mod xmldump;

pub use loader::{LoadError, ModuleLoader};
pub use module::{Module, ModuleCtx, ModuleError, ModuleSpec, Platform};
pub use params::ParamError;
pub use version::{version, version_string, PLATFORM_VERSION, PLATFORM_VERSION_STR};
