use crate::config::DiscoveryConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Resolves a service name to one live instance address (`host:port`)
pub trait ServiceDiscovery: Send + Sync {
    fn resolve(&self, service: &str) -> Option<String>;
}

/// Instances of one service with a round-robin cursor
#[derive(Debug)]
struct ServicePool {
    instances: Vec<String>,
    cursor: AtomicUsize,
}

impl ServicePool {
    fn select(&self) -> Option<&String> {
        if self.instances.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        self.instances.get(index)
    }
}

/// Discovery table read from configuration.
///
/// Service names match case-insensitively: the layered config loader
/// lowercases map keys, while `backend_addr` keeps the name as written.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, ServicePool>,
}

impl StaticDiscovery {
    pub fn new(services: HashMap<String, Vec<String>>) -> Self {
        let services = services
            .into_iter()
            .map(|(name, instances)| {
                (
                    name.to_lowercase(),
                    ServicePool {
                        instances,
                        cursor: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self { services }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.services.clone())
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn resolve(&self, service: &str) -> Option<String> {
        self.services
            .get(&service.to_lowercase())?
            .select()
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let discovery = StaticDiscovery::new(HashMap::from([(
            "order".to_string(),
            vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()],
        )]));

        assert_eq!(discovery.resolve("order").as_deref(), Some("10.0.0.1:80"));
        assert_eq!(discovery.resolve("order").as_deref(), Some("10.0.0.2:80"));
        assert_eq!(discovery.resolve("order").as_deref(), Some("10.0.0.1:80"));
    }

    #[test]
    fn test_unknown_or_empty_service() {
        let discovery =
            StaticDiscovery::new(HashMap::from([("empty".to_string(), Vec::new())]));
        assert!(discovery.resolve("empty").is_none());
        assert!(discovery.resolve("missing").is_none());
    }

    #[test]
    fn test_service_name_ignores_case() {
        let discovery = StaticDiscovery::new(HashMap::from([(
            "OrderService".to_string(),
            vec!["10.0.0.1:8000".to_string()],
        )]));
        assert_eq!(discovery.resolve("OrderService").as_deref(), Some("10.0.0.1:8000"));
        assert_eq!(discovery.resolve("orderservice").as_deref(), Some("10.0.0.1:8000"));
    }
}
