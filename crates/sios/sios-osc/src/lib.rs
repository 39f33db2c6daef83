//! OSC namespace and front-end: classes and objects under the
//! configured root path, method/parameter registration, the UDP/TCP
//! message servers, and the listener sets that outbound data fans out
//! to.

pub mod class;
pub mod endpoint;
pub mod listener;
pub mod method;
pub mod object;
pub mod server;

pub use class::{Class, Namespace, NamespaceError};
pub use endpoint::Endpoint;
pub use listener::{ListenerError, ListenerSet};
pub use method::{int_args, MethodDesc, OscHandlerFn, OscRequest};
pub use object::Object;
pub use server::{endpoint_from_request, OscServer, ServerError};

pub use rosc::OscType;
