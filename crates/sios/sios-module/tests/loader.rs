//! Load-sequence tests with an in-tree test module: parameter
//! injection, version gating, failure isolation and the lazy bucket.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use sios_config::ModuleConfig;
use sios_core::{ShutdownToken, SourceRegistry};
use sios_module::{
    loader::LoadError, params, version, Module, ModuleCtx, ModuleError, ModuleLoader,
    ModuleSpec, ParamError, Platform, PLATFORM_VERSION,
};
use sios_osc::{Namespace, Object, OscServer};

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn push_event(event: String) {
    EVENTS.with(|events| events.borrow_mut().push(event));
}

fn take_events() -> Vec<String> {
    EVENTS.with(|events| events.borrow_mut().drain(..).collect())
}

struct TestModule {
    devices: i32,
    fail_init: bool,
    object: Option<Arc<Object>>,
}

fn new_test_module() -> Box<dyn Module> {
    Box::new(TestModule {
        devices: 1,
        fail_init: false,
        object: None,
    })
}

impl Module for TestModule {
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        match name {
            "devices" => params::set_i32(&mut self.devices, value),
            "fail_init" => params::set_bool(&mut self.fail_init, value),
            other => Err(ParamError::Unknown(other.to_string())),
        }
    }

    fn init(&mut self, platform: &Platform, ctx: &ModuleCtx) -> Result<(), ModuleError> {
        if self.fail_init {
            return Err(ModuleError::Failed("asked to fail".into()));
        }
        let object = Object::new(&ctx.name, &ctx.description);
        platform.namespace.register_object(&object, &ctx.class);
        self.object = Some(object);
        push_event(format!("init devices={}", self.devices));
        Ok(())
    }

    fn exit(&mut self, platform: &Platform) {
        if let Some(object) = self.object.take() {
            platform.namespace.deregister_object(&object);
        }
        push_event("exit".to_string());
    }

    fn object(&self) -> Option<Arc<Object>> {
        self.object.clone()
    }
}

fn test_spec() -> ModuleSpec {
    ModuleSpec {
        basename: "testmod",
        version: version(1, 0, 0),
        version_str: "1.0.0",
        platform_version: PLATFORM_VERSION,
        ctor: new_test_module,
    }
}

fn stale_spec() -> ModuleSpec {
    ModuleSpec {
        platform_version: version(2, 0, 0),
        ..test_spec()
    }
}

fn platform() -> Platform {
    let shutdown = ShutdownToken::new();
    // no inbound servers needed here
    let osc = OscServer::bind(0, false, false, shutdown).unwrap();
    let namespace = Arc::new(Namespace::new("/sios"));
    namespace.register_class("sensors").unwrap();
    Platform {
        sources: Arc::new(SourceRegistry::new()),
        osc,
        namespace,
    }
}

fn module_config(lazy: bool, params: &[(&str, &str)]) -> ModuleConfig {
    ModuleConfig {
        module_path: "/usr/lib/sios/testmod.so".into(),
        module_class: "sensors".into(),
        module_description: "test module".into(),
        module_is_lazy: lazy,
        lazy_id: None,
        params: params
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

#[test]
fn loads_and_applies_params() {
    let platform = platform();
    let class = platform.namespace.find_class("sensors").unwrap();
    let loader = ModuleLoader::new(vec![test_spec()], false);

    loader
        .stage(&module_config(false, &[("devices", "4")]), class.clone())
        .unwrap();
    assert_eq!(loader.load_all(&platform), 0);

    assert!(loader.is_loaded("testmod"));
    assert_eq!(take_events(), vec!["init devices=4"]);
    assert_eq!(class.objects().len(), 1);
    assert_eq!(class.objects()[0].path(), "/sios/sensors/testmod");

    loader.unload_all(&platform);
    assert!(!loader.is_loaded("testmod"));
    assert_eq!(take_events(), vec!["exit"]);
    assert!(class.is_empty());
}

#[test]
fn version_mismatch_fails_in_strict_mode_only() {
    let platform = platform();
    let class = platform.namespace.find_class("sensors").unwrap();

    let strict = ModuleLoader::new(vec![stale_spec()], true);
    strict
        .stage(&module_config(false, &[]), class.clone())
        .unwrap();
    assert_eq!(strict.load_all(&platform), 1);
    assert!(!strict.is_loaded("testmod"));
    assert!(take_events().is_empty());

    let lenient = ModuleLoader::new(vec![stale_spec()], false);
    lenient.stage(&module_config(false, &[]), class).unwrap();
    assert_eq!(lenient.load_all(&platform), 0);
    assert!(lenient.is_loaded("testmod"));
    assert_eq!(take_events(), vec!["init devices=1"]);
    lenient.unload_all(&platform);
    take_events();
}

#[test]
fn duplicate_basename_is_refused() {
    let platform = platform();
    let class = platform.namespace.find_class("sensors").unwrap();
    let loader = ModuleLoader::new(vec![test_spec()], false);

    loader
        .stage(&module_config(false, &[]), class.clone())
        .unwrap();
    assert!(matches!(
        loader.stage(&module_config(true, &[]), class),
        Err(LoadError::Duplicate(_))
    ));
    loader.load_all(&platform);
    loader.unload_all(&platform);
    take_events();
}

#[test]
fn bad_param_aborts_initialization() {
    let platform = platform();
    let class = platform.namespace.find_class("sensors").unwrap();
    let loader = ModuleLoader::new(vec![test_spec()], false);

    loader
        .stage(&module_config(false, &[("devices", "many")]), class.clone())
        .unwrap();
    assert_eq!(loader.load_all(&platform), 1);
    assert!(!loader.is_loaded("testmod"));
    assert!(take_events().is_empty());
    assert!(class.is_empty());
}

#[test]
fn failed_init_skips_exit_on_unload() {
    let platform = platform();
    let class = platform.namespace.find_class("sensors").unwrap();
    let loader = ModuleLoader::new(vec![test_spec()], false);

    loader
        .stage(&module_config(false, &[("fail_init", "1")]), class)
        .unwrap();
    assert_eq!(loader.load_all(&platform), 1);
    assert!(!loader.is_loaded("testmod"));

    loader.unload_all(&platform);
    // init never ran, exit must not run either
    assert!(take_events().is_empty());
}

#[test]
fn lazy_module_waits_for_its_trigger() {
    let platform = platform();
    let class = platform.namespace.find_class("sensors").unwrap();
    let loader = ModuleLoader::new(vec![test_spec()], false);

    loader.stage(&module_config(true, &[]), class).unwrap();
    assert_eq!(loader.load_all(&platform), 0);
    assert!(!loader.is_loaded("testmod"));

    // trigger id defaults to the basename
    loader.trigger("testmod", &platform).unwrap();
    assert!(loader.is_loaded("testmod"));
    assert_eq!(take_events(), vec!["init devices=1"]);

    assert!(matches!(
        loader.trigger("testmod", &platform),
        Err(LoadError::UnknownLazyId(_))
    ));
    loader.unload_all(&platform);
    take_events();
}
