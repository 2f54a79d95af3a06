//! Tunneled services and their per-session manager.
//!
//! A [`ServiceManager`] owns the services bound to one session. The default
//! [`LocalServiceManager`] builds them from a [`ServiceCatalog`] of
//! factories, one per [`ServiceKind`], according to the configuration
//! snapshot the server was constructed with.

mod manager;

pub use funnel_core::ServiceKind;
pub use manager::{LocalServiceManager, LocalServiceManagerFactory};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use funnel_core::ServiceConfig;
use funnel_core::config::ShellService;

use crate::error::ServiceError;
use crate::session::{ConnectionId, Session};

/// Parameters of one service instance, taken from the configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceParams {
    pub kind: ServiceKind,
    /// Set for listener kinds only.
    pub gateway_ports: Option<bool>,
    /// Set for the shell only.
    pub shell: Option<ShellService>,
}

impl ServiceParams {
    pub fn from_config(kind: ServiceKind, config: &ServiceConfig) -> Self {
        Self {
            kind,
            gateway_ports: config.gateway_ports(kind),
            shell: (kind == ServiceKind::Shell).then(|| config.shell().clone()),
        }
    }
}

/// What a service gets to work with when it starts.
#[derive(Clone)]
pub struct ServiceContext {
    pub connection_id: ConnectionId,
    pub session: Arc<dyn Session>,
    /// Opaque to the manager; passed through unchanged.
    pub relay_only: bool,
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("connection_id", &self.connection_id)
            .field("relay_only", &self.relay_only)
            .finish_non_exhaustive()
    }
}

/// One running tunneled service instance.
#[async_trait]
pub trait Microservice: Send + Sync {
    async fn start(&self, ctx: ServiceContext) -> anyhow::Result<()>;

    /// Signal the service to stop. Must not block.
    fn stop(&self);
}

/// Builds service instances of one kind.
pub trait ServiceFactory: Send + Sync {
    fn kind(&self) -> ServiceKind;

    fn create(&self, params: &ServiceParams) -> Box<dyn Microservice>;
}

/// Service factories keyed by kind.
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    factories: HashMap<ServiceKind, Arc<dyn ServiceFactory>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same kind.
    pub fn register(&mut self, factory: Arc<dyn ServiceFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: ServiceKind) -> Option<&Arc<dyn ServiceFactory>> {
        self.factories.get(&kind)
    }

    /// Registered kinds in [`ServiceKind::ALL`] order.
    pub fn kinds(&self) -> Vec<ServiceKind> {
        ServiceKind::ALL
            .into_iter()
            .filter(|kind| self.factories.contains_key(kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Owner of the services bound to one session.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Start every enabled service. On failure, already started services
    /// are stopped before the error is returned.
    async fn start(&self) -> Result<(), ServiceError>;

    /// Signal every service to stop. Idempotent, safe after a failed start.
    fn stop(&self);
}

/// Creates the service manager for a newly fiberized session.
pub trait ServiceManagerFactory: Send + Sync {
    fn create(
        &self,
        session: Arc<dyn Session>,
        config: &ServiceConfig,
        relay_only: bool,
    ) -> Arc<dyn ServiceManager>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_carry_kind_specific_fields() {
        let mut config = ServiceConfig::default();
        config.set_gateway_ports(true);

        let listener = ServiceParams::from_config(ServiceKind::StreamListener, &config);
        assert_eq!(listener.gateway_ports, Some(true));
        assert!(listener.shell.is_none());

        let shell = ServiceParams::from_config(ServiceKind::Shell, &config);
        assert_eq!(shell.gateway_ports, None);
        assert_eq!(shell.shell.as_ref(), Some(config.shell()));

        let socks = ServiceParams::from_config(ServiceKind::Socks, &config);
        assert_eq!(socks.gateway_ports, None);
        assert!(socks.shell.is_none());
    }

    struct NullService;

    #[async_trait]
    impl Microservice for NullService {
        async fn start(&self, _ctx: ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&self) {}
    }

    struct NullFactory(ServiceKind);

    impl ServiceFactory for NullFactory {
        fn kind(&self) -> ServiceKind {
            self.0
        }

        fn create(&self, _params: &ServiceParams) -> Box<dyn Microservice> {
            Box::new(NullService)
        }
    }

    #[test]
    fn catalog_reports_registered_kinds_in_order() {
        let mut catalog = ServiceCatalog::new();
        assert!(catalog.is_empty());
        assert!(catalog.kinds().is_empty());

        catalog.register(Arc::new(NullFactory(ServiceKind::Socks)));
        catalog.register(Arc::new(NullFactory(ServiceKind::StreamListener)));
        catalog.register(Arc::new(NullFactory(ServiceKind::Socks)));

        assert!(!catalog.is_empty());
        assert_eq!(
            catalog.kinds(),
            vec![ServiceKind::StreamListener, ServiceKind::Socks]
        );
        assert!(catalog.get(ServiceKind::Shell).is_none());
    }
}
