//! Catalog-driven service manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use funnel_core::ServiceConfig;
use tracing::{debug, info, warn};

use super::{
    Microservice, ServiceCatalog, ServiceContext, ServiceKind, ServiceManager,
    ServiceManagerFactory, ServiceParams,
};
use crate::error::ServiceError;
use crate::session::Session;

/// Starts the enabled services of one session from a [`ServiceCatalog`].
pub struct LocalServiceManager {
    ctx: ServiceContext,
    config: ServiceConfig,
    catalog: ServiceCatalog,
    running: Mutex<Vec<(ServiceKind, Arc<dyn Microservice>)>>,
    stopped: AtomicBool,
}

impl LocalServiceManager {
    pub fn new(
        session: Arc<dyn Session>,
        config: ServiceConfig,
        catalog: ServiceCatalog,
        relay_only: bool,
    ) -> Self {
        Self {
            ctx: ServiceContext {
                connection_id: session.id(),
                session,
                relay_only,
            },
            config,
            catalog,
            running: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Kinds started or starting, in start order.
    pub fn running_services(&self) -> Vec<ServiceKind> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(kind, _)| *kind)
            .collect()
    }

    fn stop_running(&self) {
        let running = std::mem::take(&mut *self.running.lock().unwrap_or_else(PoisonError::into_inner));
        for (kind, service) in running.into_iter().rev() {
            service.stop();
            debug!(connection = %self.ctx.connection_id, service = %kind, "Service stopped");
        }
    }
}

#[async_trait]
impl ServiceManager for LocalServiceManager {
    async fn start(&self) -> Result<(), ServiceError> {
        let connection = self.ctx.connection_id;
        for kind in self.config.enabled_services() {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ServiceError::Stopped);
            }

            let Some(factory) = self.catalog.get(kind) else {
                warn!(connection = %connection, service = %kind, "No implementation registered, skipping");
                continue;
            };

            let service: Arc<dyn Microservice> =
                Arc::from(factory.create(&ServiceParams::from_config(kind, &self.config)));

            // Tracked before start so a concurrent stop reaches it even if
            // this future is dropped mid-start.
            {
                let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
                if self.stopped.load(Ordering::SeqCst) {
                    return Err(ServiceError::Stopped);
                }
                running.push((kind, Arc::clone(&service)));
            }

            if let Err(e) = service.start(self.ctx.clone()).await {
                warn!(connection = %connection, service = %kind, error = %e, "Service failed to start");
                self.stop_running();
                return Err(ServiceError::ServiceStart {
                    service: kind,
                    reason: e.to_string(),
                });
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ServiceError::Stopped);
            }
            info!(
                connection = %connection,
                service = %kind,
                relay_only = self.ctx.relay_only,
                "Service started"
            );
        }
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_running();
        debug!(connection = %self.ctx.connection_id, "Service manager stopped");
    }
}

/// Creates a [`LocalServiceManager`] per session, sharing one catalog.
#[derive(Clone, Default)]
pub struct LocalServiceManagerFactory {
    catalog: ServiceCatalog,
}

impl LocalServiceManagerFactory {
    pub const fn new(catalog: ServiceCatalog) -> Self {
        Self { catalog }
    }
}

impl ServiceManagerFactory for LocalServiceManagerFactory {
    fn create(
        &self,
        session: Arc<dyn Session>,
        config: &ServiceConfig,
        relay_only: bool,
    ) -> Arc<dyn ServiceManager> {
        Arc::new(LocalServiceManager::new(
            session,
            config.clone(),
            self.catalog.clone(),
            relay_only,
        ))
    }
}
