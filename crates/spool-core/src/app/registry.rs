//! ServiceRegistry - ホストプロセスが持つサービス一覧
//!
//! グローバル変数にはせず、起動側が作って必要な所へ渡す。

use std::collections::BTreeMap;
use std::sync::Arc;

use super::service::Service;
use crate::error::ServiceError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    DuplicateService(String),
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Service) -> Result<Arc<Service>, RegistryError> {
        let name = service.name().to_string();
        if self.services.contains_key(&name) {
            return Err(RegistryError::DuplicateService(name));
        }
        let service = Arc::new(service);
        self.services.insert(name, Arc::clone(&service));
        Ok(service)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    pub fn start_all(&self) -> Result<(), ServiceError> {
        for service in self.services.values() {
            service.start()?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for service in self.services.values() {
            service.stop().await;
        }
    }

    /// One `name:info` line per service, headed by "service".
    pub fn describe(&self) -> String {
        let mut lines = vec!["service".to_string()];
        for (name, service) in &self.services {
            let info = serde_json::to_string(&service.info()).unwrap_or_default();
            lines.push(format!("{name}:{info}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::ServiceConfig;
    use crate::domain::{Payload, TaskStatus};
    use crate::ports::{Handler, HandlerError};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        fn name(&self) -> &str {
            "Noop"
        }

        async fn handle(
            &self,
            _payload: &Payload,
            _cancel: &CancellationToken,
        ) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
    }

    fn service(name: &str) -> Service {
        Service::new(ServiceConfig::new(name).qps(50), Arc::new(Noop)).unwrap()
    }

    #[test]
    fn register_and_get() {
        let mut registry = ServiceRegistry::new();
        registry.register(service("a")).unwrap();
        registry.register(service("b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register(service("a")).unwrap();
        let err = registry.register(service("a")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateService("a".into()));
    }

    #[test]
    fn describe_lists_every_service() {
        let mut registry = ServiceRegistry::new();
        registry.register(service("a")).unwrap();
        registry.register(service("b")).unwrap();

        let text = registry.describe();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "service");
        assert!(lines[1].starts_with("a:{"));
        assert!(lines[1].contains("\"handler\":\"Noop\""));
        assert!(lines[2].starts_with("b:{"));
    }

    #[tokio::test]
    async fn start_and_stop_all() {
        let mut registry = ServiceRegistry::new();
        let a = registry.register(service("a")).unwrap();
        registry.register(service("b")).unwrap();

        registry.start_all().unwrap();
        assert!(registry.iter().all(|s| s.is_running()));

        let snap = a.submit(Payload::new()).await.unwrap();
        assert_eq!(snap.task_status, TaskStatus::Finished);
        assert_eq!(snap.task_results, Some(Value::Null));

        registry.stop_all().await;
        assert!(registry.iter().all(|s| !s.is_running()));
    }
}
