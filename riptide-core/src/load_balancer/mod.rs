//! Load balancing: strategy traits and the selection context.
//!
//! A strategy orders the currently eligible hosts for one selection. Callers
//! may pass advisory preferences; a strategy is free to ignore them, but an
//! honored avoid-list must never leak an avoided origin into the result, and
//! an honored preferred-origin match goes first.

pub mod busy;
pub mod metric;
pub mod round_robin;
pub mod sticky;

use std::collections::HashSet;

use crate::http::HttpRequest;
use crate::origin::{AppId, OriginId};
use crate::remote_host::RemoteHost;

/// Supplies the currently eligible hosts for one application.
///
/// Implemented by the origins inventory; always reflects the latest
/// published snapshot.
pub trait ActiveOrigins: Send + Sync {
    /// All currently active hosts, no ordering guarantee.
    fn active_hosts(&self) -> Vec<RemoteHost>;

    /// The application whose origins these are.
    fn app_id(&self) -> AppId;
}

/// Advisory selection preferences passed by callers.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    /// Pattern matched against origin ids; a trailing `*` matches any suffix.
    pub preferred_origin: Option<String>,
    /// Origins that must not be returned when the preference is honored.
    pub avoid: HashSet<OriginId>,
}

impl Preferences {
    /// Whether the host matches the preferred-origin pattern.
    pub fn prefers(&self, host: &RemoteHost) -> bool {
        match &self.preferred_origin {
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => host.origin().id().as_str().starts_with(prefix),
                None => host.origin().id().as_str() == pattern,
            },
            None => false,
        }
    }

    /// Whether the host is on the avoid-list.
    pub fn avoids(&self, host: &RemoteHost) -> bool {
        self.avoid.contains(host.origin().id())
    }
}

/// Everything a strategy may consult for one selection.
#[derive(Clone, Copy)]
pub struct LoadBalancingContext<'a> {
    /// The application being selected for.
    pub app_id: &'a AppId,
    /// The request being dispatched, when one exists (sticky sessions read
    /// its cookies). Absent for out-of-band selections.
    pub request: Option<&'a HttpRequest>,
    /// Advisory preferences.
    pub preferences: &'a Preferences,
}

/// Orders or selects candidate origins for one request.
pub trait LoadBalancer: Send + Sync {
    /// The eligible candidates for one selection, most preferred first.
    /// Reflects only origins present in the latest snapshot.
    fn choose(&self, context: &LoadBalancingContext<'_>) -> Vec<RemoteHost>;

    /// All eligible candidates with no ordering guarantee.
    fn snapshot(&self) -> Vec<RemoteHost>;
}

/// Applies advisory preferences to an already-ordered candidate list:
/// avoided hosts are dropped, a preferred match is moved to the front.
pub fn apply_preferences(mut hosts: Vec<RemoteHost>, preferences: &Preferences) -> Vec<RemoteHost> {
    hosts.retain(|host| !preferences.avoids(host));
    if let Some(position) = hosts.iter().position(|host| preferences.prefers(host)) {
        let preferred = hosts.remove(position);
        hosts.insert(0, preferred);
    }
    hosts
}


#[cfg(test)]
mod tests {
    use super::test_support::host;
    use super::*;

    #[test]
    fn avoided_hosts_are_never_returned() {
        let hosts = vec![host("app", "o0", 9000), host("app", "o1", 9001)];
        let preferences = Preferences {
            preferred_origin: None,
            avoid: [OriginId::new("o0")].into_iter().collect(),
        };
        let chosen = apply_preferences(hosts, &preferences);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].origin().id().as_str(), "o1");
    }

    #[test]
    fn preferred_match_moves_first() {
        let hosts = vec![
            host("app", "o0", 9000),
            host("app", "o1", 9001),
            host("app", "o2", 9002),
        ];
        let preferences = Preferences {
            preferred_origin: Some("o2".to_string()),
            avoid: HashSet::new(),
        };
        let chosen = apply_preferences(hosts, &preferences);
        assert_eq!(chosen[0].origin().id().as_str(), "o2");
        assert_eq!(chosen.len(), 3);
    }

    #[test]
    fn wildcard_pattern_matches_prefix() {
        let preferences = Preferences {
            preferred_origin: Some("canary-*".to_string()),
            avoid: HashSet::new(),
        };
        assert!(preferences.prefers(&host("app", "canary-1", 9000)));
        assert!(!preferences.prefers(&host("app", "stable-1", 9001)));
    }
}
