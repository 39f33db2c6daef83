use std::net::SocketAddr;
use std::sync::Arc;

use rosc::OscType;

/// One decoded inbound message as handed to a method handler.
pub struct OscRequest<'a> {
    pub path: &'a str,
    pub args: &'a [OscType],
    /// Where the message came from; `listen`/`silence` fall back to
    /// this when no explicit endpoint is supplied.
    pub source: SocketAddr,
}

/// Method handler. Returns 0 on success; a non-zero status is logged
/// but does not affect dispatch.
pub type OscHandlerFn = Arc<dyn Fn(&OscRequest<'_>) -> i32 + Send + Sync>;

/// Describes an OSC-addressable method (or parameter; both share one
/// registration path). The absolute address is the owning object's
/// path joined with `addr`.
pub struct MethodDesc {
    pub name: String,
    pub addr: String,
    pub typespec: Option<String>,
    pub desc: String,
    pub handler: OscHandlerFn,
}

impl MethodDesc {
    /// `addr` falls back to `name` when empty, as the bulk of methods
    /// are addressed by their name.
    pub fn new(
        name: impl Into<String>,
        addr: &str,
        typespec: Option<&str>,
        desc: impl Into<String>,
        handler: OscHandlerFn,
    ) -> Self {
        let name = name.into();
        let addr = if addr.len() <= 1 {
            name.clone()
        } else {
            addr.to_string()
        };
        Self {
            name,
            addr,
            typespec: typespec.map(str::to_string),
            desc: desc.into(),
            handler,
        }
    }
}

/// All arguments as i32, or `None` when any of them is not an int.
/// The driver modules take integer-only argument lists keyed on arity.
pub fn int_args(args: &[OscType]) -> Option<Vec<i32>> {
    args.iter()
        .map(|arg| match arg {
            OscType::Int(value) => Some(*value),
            _ => None,
        })
        .collect()
}

/// OSC 1.0 type tag for one argument.
pub(crate) fn type_tag(arg: &OscType) -> char {
    match arg {
        OscType::Int(_) => 'i',
        OscType::Float(_) => 'f',
        OscType::String(_) => 's',
        OscType::Blob(_) => 'b',
        OscType::Time(_) => 't',
        OscType::Long(_) => 'h',
        OscType::Double(_) => 'd',
        OscType::Char(_) => 'c',
        OscType::Color(_) => 'r',
        OscType::Midi(_) => 'm',
        OscType::Bool(true) => 'T',
        OscType::Bool(false) => 'F',
        OscType::Array(_) => '[',
        OscType::Nil => 'N',
        OscType::Inf => 'I',
    }
}

/// True when the argument tags satisfy a method's typespec. `None`
/// accepts anything (the common case, matching the original platform
/// where nearly every method registers without a typespec).
pub(crate) fn typespec_matches(typespec: Option<&str>, args: &[OscType]) -> bool {
    let Some(spec) = typespec else {
        return true;
    };
    spec.len() == args.len()
        && spec
            .chars()
            .zip(args.iter())
            .all(|(want, arg)| match (want, arg) {
                // either bool tag satisfies a declared T or F slot
                ('T' | 'F', OscType::Bool(_)) => true,
                _ => want == type_tag(arg),
            })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_addr_falls_back_to_name() {
        let handler: OscHandlerFn = Arc::new(|_| 0);
        let desc = MethodDesc::new("rgb", "", None, "set rgb color", handler.clone());
        assert_eq!(desc.addr, "rgb");

        let desc = MethodDesc::new("acc_listen", "acc/listen", None, "", handler);
        assert_eq!(desc.addr, "acc/listen");
    }

    #[test]
    fn typespec_matching() {
        assert!(typespec_matches(None, &[OscType::Int(1)]));
        assert!(typespec_matches(
            Some("iis"),
            &[OscType::Int(1), OscType::Int(2), OscType::String("x".into())]
        ));
        assert!(!typespec_matches(Some("ii"), &[OscType::Int(1)]));
        assert!(!typespec_matches(
            Some("ii"),
            &[OscType::Int(1), OscType::Float(2.0)]
        ));
        assert!(typespec_matches(Some("T"), &[OscType::Bool(false)]));
    }
}
