use std::sync::Mutex;

use tracing::{info, warn};

use crate::endpoint::Endpoint;

/// One set of subscribed endpoints, serialized by its own mutex. Used
/// both for the per-object set and for module-private stream sets.
pub type ListenerSet = Mutex<Vec<Endpoint>>;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{0} is already a listener")]
    Duplicate(Endpoint),
}

/// Adds an endpoint to a set. A duplicate (by host/port string
/// equality) is left alone and reported back to the caller.
pub fn add_listener(
    set: &ListenerSet,
    owner: &str,
    endpoint: Endpoint,
) -> Result<(), ListenerError> {
    let mut listeners = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if listeners.contains(&endpoint) {
        warn!("{endpoint} already a listener of {owner}");
        return Err(ListenerError::Duplicate(endpoint));
    }
    info!("added {endpoint} as listener of {owner}");
    listeners.push(endpoint);
    Ok(())
}

/// Removes an endpoint from a set; a miss is a no-op. Returns whether
/// an entry was removed.
pub fn del_listener(set: &ListenerSet, owner: &str, endpoint: &Endpoint) -> bool {
    let mut listeners = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(pos) = listeners.iter().position(|l| l == endpoint) {
        listeners.remove(pos);
        info!("removed {endpoint} as listener of {owner}");
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_add_keeps_one_entry() {
        let set = ListenerSet::default();
        let ep = Endpoint::new("10.0.0.1", "9000");

        add_listener(&set, "dummy", ep.clone()).unwrap();
        assert!(matches!(
            add_listener(&set, "dummy", ep.clone()),
            Err(ListenerError::Duplicate(_))
        ));
        assert_eq!(set.lock().unwrap().as_slice(), &[ep]);
    }

    #[test]
    fn del_removes_exactly_one_entry() {
        let set = ListenerSet::default();
        let a = Endpoint::new("10.0.0.1", "9000");
        let b = Endpoint::new("10.0.0.2", "9000");

        add_listener(&set, "dummy", a.clone()).unwrap();
        add_listener(&set, "dummy", b.clone()).unwrap();

        assert!(del_listener(&set, "dummy", &a));
        assert!(!del_listener(&set, "dummy", &a));
        assert_eq!(set.lock().unwrap().as_slice(), &[b]);
    }
}
