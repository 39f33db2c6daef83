//! Optional XML introspection dumps written once at startup: the OSC
//! endpoint description, the registered classes, and one file per
//! loaded module.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::warn;

use sios_config::Config;
use sios_osc::Namespace;

use crate::loader::ModuleLoader;
use crate::version::version_string;

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn write_file(dir: &Path, name: &str, contents: &str) {
    let path = dir.join(name);
    if let Err(err) = fs::write(&path, contents) {
        warn!("could not write xml dump '{}': {err}", path.display());
    }
}

/// Dumps `osc.xml`, `classes.xml` and one `<prefix>_<module>.xml` per
/// loaded module under the configured dump path.
pub fn dump_xml(config: &Config, namespace: &Namespace, loader: &ModuleLoader) {
    let Some(dir) = config.xml_dump_path.as_deref() else {
        return;
    };
    let dir = Path::new(dir);

    let mut osc = String::new();
    if config.osc.osc_udp {
        let _ = writeln!(
            osc,
            "<osc port=\"{}\" proto=\"udp\" root=\"{}\"/>",
            config.osc.osc_port,
            escape(&config.osc.osc_root)
        );
    }
    if config.osc.osc_tcp {
        let _ = writeln!(
            osc,
            "<osc port=\"{}\" proto=\"tcp\" root=\"{}\"/>",
            config.osc.osc_port,
            escape(&config.osc.osc_root)
        );
    }
    write_file(dir, "osc.xml", &osc);

    let mut classes = String::new();
    for class in namespace.classes() {
        let _ = writeln!(classes, "<class name=\"{}\"/>", escape(class.name()));
    }
    write_file(dir, "classes.xml", &classes);

    loader.with_loaded(|modules| {
        for module in modules {
            let mut xml = String::new();
            let _ = writeln!(
                xml,
                "<module name=\"{}\" version=\"{}\" class=\"{}\" description=\"{}\">",
                escape(module.basename()),
                version_string(module.version()),
                escape(module.class().name()),
                escape(module.description())
            );
            for desc in module.object().methods() {
                let _ = writeln!(
                    xml,
                    "  <method name=\"{}\" address=\"{}/{}\" description=\"{}\"/>",
                    escape(&desc.name),
                    escape(&module.object().path()),
                    escape(&desc.addr),
                    escape(&desc.desc)
                );
            }
            for desc in module.object().params() {
                let _ = writeln!(
                    xml,
                    "  <param name=\"{}\" address=\"{}/{}\" description=\"{}\"/>",
                    escape(&desc.name),
                    escape(&module.object().path()),
                    escape(&desc.name),
                    escape(&desc.desc)
                );
            }
            let _ = writeln!(xml, "</module>");
            write_file(
                dir,
                &format!("{}_{}.xml", config.xml_module_prefix, module.basename()),
                &xml,
            );
        }
    });
}
