use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::{ClientManager, ConnectionCheck};
use crate::config::{MessageOrder, ParserConfig};
use crate::error::ServiceError;
use crate::fetcher::{self, MessageRecord};
use crate::platform::Identity;

/// A validated parse request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub channel: String,
    pub limit: usize,
    pub cutoff: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub timeout: Duration,
    pub order: MessageOrder,
    pub queue_depth: usize,
}

impl From<&ParserConfig> for RunnerSettings {
    fn from(config: &ParserConfig) -> Self {
        Self {
            timeout: config.fetch_timeout(),
            order: config.order,
            queue_depth: config.queue_depth,
        }
    }
}

enum Job {
    Fetch {
        id: Uuid,
        request: FetchRequest,
        reply: oneshot::Sender<Result<Vec<MessageRecord>, ServiceError>>,
    },
    Status {
        id: Uuid,
        reply: oneshot::Sender<Result<Identity, ServiceError>>,
    },
    Heartbeat {
        reply: oneshot::Sender<ConnectionCheck>,
    },
}

/// Handle to the background task that owns the platform client. Cheap to
/// clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct Runner {
    tx: mpsc::Sender<Job>,
}

impl Runner {
    pub fn spawn(manager: ClientManager, settings: RunnerSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_depth);
        let worker = Worker {
            manager,
            timeout: settings.timeout,
            order: settings.order,
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<Vec<MessageRecord>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.submit(Job::Fetch { id, request, reply }).await?;
        rx.await.map_err(|_| ServiceError::Unavailable)?
    }

    pub async fn status(&self) -> Result<Identity, ServiceError> {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.submit(Job::Status { id, reply }).await?;
        rx.await.map_err(|_| ServiceError::Unavailable)?
    }

    pub async fn heartbeat(&self) -> Result<ConnectionCheck, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Heartbeat { reply }).await?;
        rx.await.map_err(|_| ServiceError::Unavailable)
    }

    async fn submit(&self, job: Job) -> Result<(), ServiceError> {
        self.tx.send(job).await.map_err(|_| ServiceError::Unavailable)
    }
}

struct Worker {
    manager: ClientManager,
    timeout: Duration,
    order: MessageOrder,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Job>) {
        info!("Client runner started");

        while let Some(job) = rx.recv().await {
            match job {
                Job::Fetch { id, request, reply } => {
                    let result = self.fetch(id, request).await;
                    if reply.send(result).is_err() {
                        warn!("Job {}: caller went away before the reply", id);
                    }
                }
                Job::Status { id, reply } => {
                    let result = self.status(id).await;
                    let _ = reply.send(result);
                }
                Job::Heartbeat { reply } => {
                    let _ = reply.send(self.manager.check_connection().await);
                }
            }
        }

        self.manager.release().await;
        info!("Client runner stopped");
    }

    async fn fetch(
        &mut self,
        id: Uuid,
        request: FetchRequest,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        info!(
            "Job {}: parse channel={} limit={} cutoff={:?}",
            id, request.channel, request.limit, request.cutoff
        );

        let manager = &mut self.manager;
        let work = async {
            let client = manager.ensure_connected().await?;
            fetcher::fetch(client.as_ref(), &request.channel, request.limit, request.cutoff).await
        };

        let result = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => {
                self.manager.release().await;
                result
            }
            Err(_) => {
                self.manager.reset().await;
                Err(ServiceError::Timeout(self.timeout))
            }
        };

        match result {
            Ok(mut records) => {
                if self.order == MessageOrder::OldestFirst {
                    records.reverse();
                }
                info!("Job {}: {} message(s) from {}", id, records.len(), request.channel);
                Ok(records)
            }
            Err(e) => {
                error!("Job {}: error while parsing channel {}: {}", id, request.channel, e);
                Err(e)
            }
        }
    }

    async fn status(&mut self, id: Uuid) -> Result<Identity, ServiceError> {
        let manager = &mut self.manager;
        let work = async {
            let client = manager.ensure_connected().await?;
            client
                .get_me()
                .await
                .map_err(|e| ServiceError::Connect(e.to_string()))
        };

        let result = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => {
                self.manager.release().await;
                result
            }
            Err(_) => {
                self.manager.reset().await;
                Err(ServiceError::Timeout(self.timeout))
            }
        };

        if let Err(e) = &result {
            error!("Job {}: status check failed: {}", id, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Lifecycle};
    use crate::platform::testing::{self, at, post, ScriptedClient, ScriptedConnector};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn config(lifecycle: Lifecycle) -> Arc<Config> {
        let mut config = testing::configured();
        config.parser.lifecycle = lifecycle;
        Arc::new(config)
    }

    fn settings(order: MessageOrder) -> RunnerSettings {
        RunnerSettings {
            timeout: Duration::from_secs(5),
            order,
            queue_depth: 8,
        }
    }

    fn example_connector() -> Arc<ScriptedConnector> {
        Arc::new(ScriptedConnector::new(|| {
            Ok(ScriptedClient::new(
                "@example",
                vec![
                    post(3, Some(at(2024, 3, 1)), "c"),
                    post(2, Some(at(2024, 2, 1)), "b"),
                    post(1, Some(at(2024, 1, 1)), "a"),
                ],
            ))
        }))
    }

    fn request(limit: usize) -> FetchRequest {
        FetchRequest {
            channel: "@example".to_string(),
            limit,
            cutoff: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_newest_first() {
        let connector = example_connector();
        let manager = ClientManager::new(connector, config(Lifecycle::Reuse));
        let runner = Runner::spawn(manager, settings(MessageOrder::NewestFirst));

        let records = runner.fetch(request(10)).await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_fetch_oldest_first() {
        let connector = example_connector();
        let manager = ClientManager::new(connector, config(Lifecycle::Reuse));
        let runner = Runner::spawn(manager, settings(MessageOrder::OldestFirst));

        let records = runner.fetch(request(2)).await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_client() {
        let connector = example_connector();
        let manager = ClientManager::new(connector.clone(), config(Lifecycle::Reuse));
        let runner = Runner::spawn(manager, settings(MessageOrder::NewestFirst));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let runner = runner.clone();
            handles.push(tokio::spawn(async move { runner.fetch(request(2)).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 2);
        }
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_per_request_lifecycle_reconnects_each_time() {
        let connector = example_connector();
        let manager = ClientManager::new(connector.clone(), config(Lifecycle::PerRequest));
        let runner = Runner::spawn(manager, settings(MessageOrder::NewestFirst));

        runner.fetch(request(1)).await.unwrap();
        runner.fetch(request(1)).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert!(!connector
            .last_issued()
            .unwrap()
            .connected
            .load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stalled_fetch_times_out_and_drops_client() {
        let connector = Arc::new(ScriptedConnector::new(|| {
            let mut client = ScriptedClient::new("@example", Vec::new());
            client.stall = true;
            Ok(client)
        }));
        let manager = ClientManager::new(connector.clone(), config(Lifecycle::Reuse));
        let runner = Runner::spawn(
            manager,
            RunnerSettings {
                timeout: Duration::from_millis(50),
                order: MessageOrder::NewestFirst,
                queue_depth: 1,
            },
        );

        let err = runner.fetch(request(5)).await.unwrap_err();
        assert_eq!(err, ServiceError::Timeout(Duration::from_millis(50)));
        assert_eq!(err.to_string(), "Timed out after 50ms");

        runner.fetch(request(5)).await.unwrap_err();
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_configuration_error_reaches_caller() {
        let manager = ClientManager::new(example_connector(), Arc::new(Config::default()));
        let runner = Runner::spawn(manager, settings(MessageOrder::NewestFirst));

        let err = runner.fetch(request(1)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_status_reports_identity() {
        let manager = ClientManager::new(example_connector(), config(Lifecycle::Reuse));
        let runner = Runner::spawn(manager, settings(MessageOrder::NewestFirst));

        let me = runner.status().await.unwrap();
        assert_eq!(me.id, 42);
        assert_eq!(me.username.as_deref(), Some("parser_bot"));
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_create_client() {
        let connector = example_connector();
        let manager = ClientManager::new(connector.clone(), config(Lifecycle::Reuse));
        let runner = Runner::spawn(manager, settings(MessageOrder::NewestFirst));

        assert_eq!(runner.heartbeat().await.unwrap(), ConnectionCheck::Idle);
        assert_eq!(connector.connect_count(), 0);

        runner.fetch(request(1)).await.unwrap();
        assert_eq!(runner.heartbeat().await.unwrap(), ConnectionCheck::Healthy);
    }

    #[tokio::test]
    async fn test_closed_queue_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let runner = Runner { tx };
        assert_eq!(
            runner.fetch(request(1)).await.unwrap_err(),
            ServiceError::Unavailable
        );
    }
}
