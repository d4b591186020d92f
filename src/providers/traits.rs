use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Base trait for providers that can create components asynchronously.
///
/// # Example
///
/// ```no_run
/// use arm_ecd::providers::traits::AsyncProvider;
///
/// struct IdentityProvider;
///
/// #[async_trait::async_trait]
/// impl AsyncProvider<String> for IdentityProvider {
///     async fn provide(&self) -> anyhow::Result<String> {
///         Ok("ASUS Vivobook S 15".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// Trait for services that can be started through TaskManager.
///
/// # Example
///
/// ```no_run
/// use arm_ecd::providers::traits::ServiceProvider;
/// use arm_ecd::task_manager::TaskManager;
/// use anyhow::Result;
///
/// struct ExampleService;
///
/// #[async_trait::async_trait]
/// impl ServiceProvider for ExampleService {
///     async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
///         task_manager.spawn_task("example".to_string(), |token| async move {
///             token.cancelled().await;
///             Ok(())
///         }).await
///     }
///
///     fn name(&self) -> &'static str { "ExampleService" }
///     fn priority(&self) -> i32 { 5 }
///     fn is_critical(&self) -> bool { false }
/// }
/// ```
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Starts the service in TaskManager.
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    /// Returns service name for logging and management.
    fn name(&self) -> &'static str;

    /// Returns startup priority (higher numbers start first).
    fn priority(&self) -> i32 {
        0
    }

    /// Indicates if service is critical for system operation.
    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    struct FixedProvider(&'static str);

    #[async_trait]
    impl AsyncProvider<String> for FixedProvider {
        async fn provide(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct RecordingService {
        name: &'static str,
        priority: i32,
        critical: bool,
        ran: Arc<AtomicBool>,
    }

    impl RecordingService {
        fn new(name: &'static str, priority: i32, critical: bool) -> Self {
            Self {
                name,
                priority,
                critical,
                ran: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ServiceProvider for RecordingService {
        async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
            let ran = self.ran.clone();
            task_manager
                .spawn_task(self.name.to_string(), move |token| async move {
                    ran.store(true, Ordering::SeqCst);
                    token.cancelled().await;
                    Ok(())
                })
                .await
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn is_critical(&self) -> bool {
            self.critical
        }
    }

    struct BrokenService;

    #[async_trait]
    impl ServiceProvider for BrokenService {
        async fn start(&self, _task_manager: &mut TaskManager) -> Result<()> {
            Err(anyhow!("no system bus"))
        }

        fn name(&self) -> &'static str {
            "BrokenService"
        }
    }

    #[tokio::test]
    async fn provider_as_trait_object() {
        let provider: Box<dyn AsyncProvider<String> + Send + Sync> =
            Box::new(FixedProvider("ok"));
        assert_eq!(provider.provide().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn defaults_are_low_priority_and_optional() {
        assert_eq!(BrokenService.priority(), 0);
        assert!(!BrokenService.is_critical());
    }

    #[tokio::test]
    async fn started_service_runs_until_shutdown() {
        let mut task_manager = TaskManager::new();
        let service = RecordingService::new("recorder", 5, true);

        service.start(&mut task_manager).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(service.ran.load(Ordering::SeqCst));
        assert!(task_manager.is_running("recorder"));

        task_manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn priority_ordering_puts_critical_reporting_first() {
        let mut services: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(RecordingService::new("fire", 2, false)),
            Box::new(RecordingService::new("report", 10, true)),
            Box::new(BrokenService),
            Box::new(RecordingService::new("power", 8, false)),
        ];
        services.sort_by_key(|s| std::cmp::Reverse(s.priority()));

        let names: Vec<_> = services.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["report", "power", "fire", "BrokenService"]);
    }

    #[tokio::test]
    async fn failing_start_reports_cause() {
        let mut task_manager = TaskManager::new();
        let err = BrokenService.start(&mut task_manager).await.unwrap_err();
        assert!(err.to_string().contains("no system bus"));
        assert_eq!(task_manager.active_count(), 0);
    }
}
