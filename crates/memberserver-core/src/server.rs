//! ============================================================================
//! Member Server - Wiring
//! ============================================================================
//! Builds the store, bus, providers and managers from a [`Config`] and
//! registers the periodic tasks with the scheduler.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::{LocalBus, MessageBus, WsBus};
use crate::config::{Config, TaskIntervals};
use crate::db::{MemberDb, Store};
use crate::ipcheck::{HttpIpSource, IpChangeMonitor, IpSource};
use crate::membership::MembershipEvaluator;
use crate::notify::{EmailNotifier, FanoutNotifier, LogNotifier, Notifier, SlackWebhookNotifier};
use crate::payments::{PaymentProvider, PaypalClient};
use crate::resources::{DeviceClient, HttpDeviceClient, ResourceSyncManager, SyncConfig};
use crate::scheduler::{Task, TaskScheduler, TaskStats};

pub const TASK_CHECK_SUBSCRIPTIONS: &str = "check-member-subscriptions";
pub const TASK_RECONCILE_ACLS: &str = "reconcile-acls";
pub const TASK_RESOURCE_STATUS: &str = "resource-status";
pub const TASK_UPDATE_RESOURCES: &str = "update-resources";
pub const TASK_CHECK_IP: &str = "check-ip-address";

/// External collaborators, injectable for tests
pub struct Components {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn MessageBus>,
    pub devices: Arc<dyn DeviceClient>,
    pub payments: Option<Arc<dyn PaymentProvider>>,
    pub notifier: Arc<dyn Notifier>,
    pub ip_source: Arc<dyn IpSource>,
}

pub struct MemberServer {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    sync: Arc<ResourceSyncManager>,
    evaluator: Arc<MembershipEvaluator>,
    ip_monitor: Arc<IpChangeMonitor>,
    scheduler: TaskScheduler,
    intervals: TaskIntervals,
}

impl MemberServer {
    /// Open the store and build every client the configuration enables.
    /// A store that cannot be opened is fatal.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = MemberDb::open(config.db_path.as_deref())
            .map_err(|e| anyhow!("Failed to open member store: {}", e))?;
        info!("Member store at {}", db.path().display());

        let bus: Arc<dyn MessageBus> = match config.bus_url.as_deref() {
            Some(url) => {
                info!("Using bus relay at {}", url);
                Arc::new(WsBus::new(url))
            }
            None => {
                info!("BUS_URL not set, using in-process bus");
                Arc::new(LocalBus::new())
            }
        };

        let payments: Option<Arc<dyn PaymentProvider>> = match config.paypal() {
            Some((url, id, secret)) => Some(Arc::new(PaypalClient::new(
                url,
                id.to_string(),
                secret.to_string(),
            ))),
            None => {
                warn!("PayPal not configured, subscription checks disabled");
                None
            }
        };

        let components = Components {
            store: Arc::new(db),
            bus,
            devices: Arc::new(HttpDeviceClient::new(config.device_timeout)),
            payments,
            notifier: Arc::new(notifier_from_config(config)),
            ip_source: Arc::new(HttpIpSource::new(config.ip_check_url.clone())),
        };
        Ok(Self::new(config, components))
    }

    pub fn new(config: &Config, components: Components) -> Self {
        let Components {
            store,
            bus,
            devices,
            payments,
            notifier,
            ip_source,
        } = components;

        let sync = Arc::new(ResourceSyncManager::new(
            store.clone(),
            bus.clone(),
            devices,
            notifier.clone(),
            SyncConfig {
                auto_push_on_mismatch: config.auto_push_on_mismatch,
                retry: config.retry.clone(),
            },
        ));

        let evaluator = MembershipEvaluator::new(store.clone(), payments, config.thresholds)
            .with_retry(config.retry.clone())
            .with_observer(sync.clone())
            .with_notifier(notifier.clone());

        let ip_monitor = IpChangeMonitor::new(store.clone(), ip_source, notifier);

        Self {
            store,
            bus,
            sync,
            evaluator: Arc::new(evaluator),
            ip_monitor: Arc::new(ip_monitor),
            scheduler: TaskScheduler::new(),
            intervals: config.intervals.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sync(&self) -> &Arc<ResourceSyncManager> {
        &self.sync
    }

    pub fn evaluator(&self) -> &Arc<MembershipEvaluator> {
        &self.evaluator
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.scheduler.stats()
    }

    /// The periodic work of the server
    pub fn tasks(&self) -> Vec<Task> {
        let evaluator = self.evaluator.clone();
        let check_subscriptions = Task::new(
            TASK_CHECK_SUBSCRIPTIONS,
            self.intervals.check_subscriptions,
            move |cancel| {
                let evaluator = evaluator.clone();
                async move {
                    match evaluator.evaluate_all(&cancel).await {
                        Ok(report) => info!("Subscription check finished: {:?}", report),
                        Err(e) => error!("Subscription check failed: {}", e),
                    }
                }
            },
        );

        let sync = self.sync.clone();
        let reconcile = Task::new(TASK_RECONCILE_ACLS, self.intervals.reconcile_acls, move |cancel| {
            let sync = sync.clone();
            async move {
                match sync.reconcile_all(&cancel).await {
                    Ok(report) => info!(
                        "ACL reconcile: {} pushed, {} failed, {} skipped",
                        report.pushed.len(),
                        report.failed.len(),
                        report.skipped
                    ),
                    Err(e) => error!("ACL reconcile failed: {}", e),
                }
            }
        });

        let sync = self.sync.clone();
        let init_sync = self.sync.clone();
        let status = Task::new(TASK_RESOURCE_STATUS, self.intervals.resource_status, move |_cancel| {
            let sync = sync.clone();
            async move {
                let failed = sync.check_all_status().await;
                if failed > 0 {
                    warn!("{} resources failed their status check", failed);
                }
            }
        })
        .with_init(move |_cancel| {
            let sync = init_sync.clone();
            async move {
                match sync.init_resources().await {
                    Ok(n) => info!("Initialized {} resources", n),
                    Err(e) => error!("Resource initialization failed: {}", e),
                }
            }
        });

        let sync = self.sync.clone();
        let update = Task::new(TASK_UPDATE_RESOURCES, self.intervals.update_resources, move |cancel| {
            let sync = sync.clone();
            async move {
                match sync.update_resources(&cancel).await {
                    Ok(report) if !report.pushed.is_empty() || !report.failed.is_empty() => info!(
                        "Resource update: {} pushed, {} failed",
                        report.pushed.len(),
                        report.failed.len()
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Resource update failed: {}", e),
                }
            }
        });

        let monitor = self.ip_monitor.clone();
        let check_ip = Task::new(TASK_CHECK_IP, self.intervals.check_ip, move |_cancel| {
            let monitor = monitor.clone();
            async move {
                if let Err(e) = monitor.check().await {
                    error!("IP check failed: {}", e);
                }
            }
        });

        vec![check_subscriptions, reconcile, status, update, check_ip]
    }

    /// Connect the bus, then hand the tasks to the scheduler
    pub async fn start(&self) -> Result<()> {
        self.bus
            .connect()
            .await
            .map_err(|e| anyhow!("Failed to connect message bus: {}", e))?;
        self.scheduler.setup(self.tasks())?;
        info!("Member server started");
        Ok(())
    }

    /// Stop bus-triggered passes, wait for running ticks, then close the bus
    pub async fn shutdown(&self) {
        info!("Shutting down member server");
        self.sync.shutdown_token().cancel();
        self.scheduler.shutdown().await;
        self.bus.shutdown().await;
        info!("Member server stopped");
    }
}

fn notifier_from_config(config: &Config) -> FanoutNotifier {
    let mut children: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];

    if let Some(url) = &config.slack_webhook_url {
        children.push(Arc::new(SlackWebhookNotifier::new(url.clone())));
    }

    match (
        &config.resend_api_key,
        &config.email_from_address,
        &config.admin_email,
    ) {
        (Some(key), Some(from), Some(admin)) => {
            let from_name = config
                .email_from_name
                .clone()
                .unwrap_or_else(|| "Member Server".to_string());
            children.push(Arc::new(EmailNotifier::new(
                key.clone(),
                from.clone(),
                from_name,
                admin.clone(),
            )));
        }
        (Some(_), _, _) => warn!("RESEND_API_KEY set without EMAIL_FROM_ADDRESS/ADMIN_EMAIL, email disabled"),
        _ => {}
    }

    FanoutNotifier::new(children)
}
