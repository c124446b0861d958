//! A process-wide collection of named routers.

use crate::backend::{self, Connection};
use crate::policy::Policy;
use crate::router::{self, Router};
use crate::servers::ServerConfig;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("A router named {0:?} already exists")]
    AlreadyInitialized(String),

    #[error(transparent)]
    Router(#[from] router::Error),
}

/// Owns routers by name, so that independent parts of an application can
/// share them.
pub struct PoolRegistry<Conn: Connection> {
    routers: Mutex<BTreeMap<String, Arc<Router<Conn>>>>,
}

impl<Conn: Connection> Default for PoolRegistry<Conn> {
    fn default() -> Self {
        Self {
            routers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<Conn: Connection> PoolRegistry<Conn> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a router.
    ///
    /// Fails if a router with this name is already registered.
    #[instrument(skip(self, config, connector, policy), name = "PoolRegistry::init")]
    pub fn init(
        &self,
        name: &str,
        config: &ServerConfig,
        connector: backend::SharedConnector<Conn>,
        policy: Policy,
    ) -> Result<Arc<Router<Conn>>, Error> {
        let mut routers = self.routers.lock().unwrap();
        if routers.contains_key(name) {
            return Err(Error::AlreadyInitialized(name.to_string()));
        }
        let router = Arc::new(Router::new(config, connector, policy)?);
        routers.insert(name.to_string(), router.clone());
        event!(Level::INFO, name, "Registered router");
        Ok(router)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Router<Conn>>> {
        self.routers.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.routers.lock().unwrap().keys().cloned().collect()
    }

    /// Unregisters and terminates a router.
    ///
    /// Returns false if no router has this name. Callers still holding the
    /// router see its operations fail with [router::Error::Terminated].
    #[instrument(skip(self), name = "PoolRegistry::shutdown")]
    pub async fn shutdown(&self, name: &str) -> bool {
        let router = self.routers.lock().unwrap().remove(name);
        match router {
            Some(router) => {
                router.terminate().await;
                event!(Level::INFO, name, "Shut down router");
                true
            }
            None => false,
        }
    }

    /// Unregisters and terminates every router.
    pub async fn shutdown_all(&self) {
        let routers = std::mem::take(&mut *self.routers.lock().unwrap());
        for (name, router) in routers {
            router.terminate().await;
            event!(Level::INFO, name = %name, "Shut down router");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{TestConnection, TestConnector};

    fn config() -> ServerConfig {
        ServerConfig::new(["10.0.0.1:11211", "10.0.0.2:11211"])
    }

    #[tokio::test]
    async fn test_init_get_shutdown() {
        let registry = PoolRegistry::<TestConnection>::new();
        let connector = Arc::new(TestConnector::new());

        let router = registry
            .init("default", &config(), connector.clone(), Policy::default())
            .unwrap();
        assert!(Arc::ptr_eq(&router, &registry.get("default").unwrap()));
        assert!(registry.get("other").is_none());

        let err = registry
            .init("default", &config(), connector.clone(), Policy::default())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(name) if name == "default"));

        assert!(registry.shutdown("default").await);
        assert!(!registry.shutdown("default").await);
        assert!(registry.get("default").is_none());
        assert!(matches!(
            router.resolve("key", None).await.map(|_| ()),
            Err(router::Error::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = PoolRegistry::<TestConnection>::new();
        let connector = Arc::new(TestConnector::new());
        for name in ["a", "b"] {
            registry
                .init(name, &config(), connector.clone(), Policy::default())
                .unwrap();
        }
        assert_eq!(registry.names(), vec!["a", "b"]);

        registry.shutdown_all().await;
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn test_bad_config_is_not_registered() {
        let registry = PoolRegistry::<TestConnection>::new();
        let err = registry
            .init(
                "bad",
                &ServerConfig::new(Vec::<String>::new()),
                Arc::new(TestConnector::new()),
                Policy::default(),
            )
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::Router(router::Error::Config(_))));
        assert!(registry.get("bad").is_none());
    }
}
