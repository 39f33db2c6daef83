//! The platform daemon: reads the configuration, brings up the OSC
//! front-end and the pump threads, loads the configured modules and
//! idles until SIGINT/SIGQUIT asks for a clean teardown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sios_config::{Config, DEFAULT_CONFIG_PATH};
use sios_core::{Pumps, ShutdownToken, SourceRegistry};
use sios_module::xmldump;
use sios_module::{ModuleLoader, ModuleSpec, Platform, PLATFORM_VERSION_STR};
use sios_osc::{MethodDesc, Namespace, Object, OscServer, OscType};

#[derive(Parser)]
#[command(name = "siosd", version = PLATFORM_VERSION_STR, about = "SIOS sensor/actuator platform")]
struct Cli {
    /// OSC server port (overrides the configuration)
    #[arg(short = 'p', long = "osc_port")]
    osc_port: Option<u16>,

    /// Configuration file
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Every module artifact linked into this build. The configuration
/// selects which of them get instantiated.
fn available_modules() -> Vec<ModuleSpec> {
    vec![
        sios_accmag::SPEC,
        sios_light::SPEC,
        sios_matrix::SPEC,
        sios_pwm::BEEP_SPEC,
        sios_pwm::BUZZ_SPEC,
    ]
}

fn init_tracing(use_syslog: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if use_syslog {
        // plain output for capture by the system logger
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// The `system` class carries platform control methods; for now that
/// is the lazy-module trigger at `<root>/system/modules/load`.
fn register_system_object(platform: &Platform, loader: &Arc<ModuleLoader>) {
    let class = match platform.namespace.find_class("system") {
        Some(class) => class,
        None => match platform.namespace.register_class("system") {
            Ok(class) => class,
            Err(err) => {
                warn!("cannot register system class: {err}");
                return;
            }
        },
    };

    let object = Object::new("modules", "module control");
    platform.namespace.register_object(&object, &class);

    let trigger_loader = loader.clone();
    let trigger_platform = platform.clone();
    let load = MethodDesc::new(
        "load",
        "",
        Some("s"),
        "load a lazy module by id",
        Arc::new(move |req: &sios_osc::OscRequest<'_>| {
            let Some(OscType::String(id)) = req.args.first() else {
                return -1;
            };
            match trigger_loader.trigger(id, &trigger_platform) {
                Ok(()) => 0,
                Err(err) => {
                    warn!("lazy load '{id}' failed: {err}");
                    -1
                }
            }
        }),
    );
    if let Err(err) = platform.osc.add_method(&object, load) {
        warn!("cannot register system methods: {err}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.display().to_string()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error reading configuration: {err}");
            return ExitCode::from(1);
        }
    };

    init_tracing(config.use_syslog);
    info!("starting SIOS version {PLATFORM_VERSION_STR}");

    // commandline port overrules config
    if let Some(port) = cli.osc_port {
        config.osc.osc_port = port;
    }

    let shutdown = ShutdownToken::new();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGQUIT] {
        if let Err(err) = signal_hook::flag::register(signal, shutdown.flag()) {
            warn!("cannot register signal handler: {err}");
        }
    }

    let osc = match OscServer::bind(
        config.osc.osc_port,
        config.osc.osc_udp,
        config.osc.osc_tcp,
        shutdown.clone(),
    ) {
        Ok(osc) => osc,
        Err(err) => {
            tracing::error!("initializing OSC failed: {err}");
            return ExitCode::from(10);
        }
    };

    let sources = Arc::new(SourceRegistry::new());
    let pumps = match Pumps::spawn(sources.clone(), shutdown.clone()) {
        Ok(pumps) => pumps,
        Err(err) => {
            tracing::error!("initializing core failed: {err}");
            return ExitCode::from(2);
        }
    };

    let namespace = Arc::new(Namespace::new(config.osc.osc_root.clone()));
    let platform = Platform {
        sources,
        osc: osc.clone(),
        namespace: namespace.clone(),
    };

    for class in &config.classes {
        let _ = namespace.register_class(&class.name);
    }

    let loader = Arc::new(ModuleLoader::new(
        available_modules(),
        config.strict_versioning,
    ));
    for module in &config.modules {
        match namespace.find_class(&module.module_class) {
            Some(class) => {
                if let Err(err) = loader.stage(module, class) {
                    warn!("cannot stage '{}': {err}", module.module_path);
                }
            }
            None => warn!(
                "unknown class '{}' for module '{}'",
                module.module_class, module.module_path
            ),
        }
    }

    let failures = loader.load_all(&platform);
    if failures > 0 {
        warn!("failed loading {failures} modules");
    }

    register_system_object(&platform, &loader);

    if config.dump_module_xml {
        xmldump::dump_xml(&config, &namespace, &loader);
    }

    while !shutdown.is_halted() {
        thread::sleep(Duration::from_secs(1));
    }

    info!("caught SIGINT/SIGQUIT, exiting...");
    loader.unload_all(&platform);
    pumps.join();
    osc.join();
    ExitCode::SUCCESS
}
