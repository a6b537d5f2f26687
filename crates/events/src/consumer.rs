//! Consumer group member and its partition workers.
//!
//! [`ConsumerWorker`] joins a consumer group, and for every partition the
//! broker assigns it spawns one long-lived task that processes that
//! partition's records strictly one after another. Different partitions
//! run concurrently. All tasks stop cooperatively when the
//! [`CancellationToken`] passed to [`ConsumerWorker::run`] is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerConsumer, BrokerError, GroupId, PartitionStream};
use crate::dispatcher::{Dispatcher, Disposition};

/// Pause after a broker error before polling the partition again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One member of a consumer group.
pub struct ConsumerWorker {
    consumer: Arc<dyn BrokerConsumer>,
    dispatcher: Arc<Dispatcher>,
    topic: String,
    group: GroupId,
}

impl ConsumerWorker {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        dispatcher: Arc<Dispatcher>,
        topic: impl Into<String>,
        group: GroupId,
    ) -> Self {
        Self {
            consumer,
            dispatcher,
            topic: topic.into(),
            group,
        }
    }

    /// Run until `cancel` fires or the broker ends the membership.
    ///
    /// Returns an error only if the initial subscription fails. On exit all
    /// partition workers have stopped, and none of them committed a record
    /// whose handler had not completed.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let mut subscription = self.consumer.subscribe(&self.topic, &self.group).await?;
        tracing::info!(topic = %self.topic, group = %self.group, "Consumer started");

        let workers_cancel = cancel.child_token();
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(topic = %self.topic, group = %self.group, "Consumer shutting down");
                    break;
                }
                assigned = subscription.next_partition() => {
                    let Some(stream) = assigned else {
                        tracing::info!(topic = %self.topic, group = %self.group, "Subscription ended");
                        break;
                    };
                    tracing::info!(
                        topic = %self.topic,
                        group = %self.group,
                        partition = stream.partition(),
                        "Partition assigned, starting worker",
                    );
                    workers.spawn(run_partition(
                        Arc::clone(&self.dispatcher),
                        stream,
                        workers_cancel.clone(),
                    ));
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Partition worker terminated abnormally");
                    }
                }
            }
        }

        workers_cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Partition worker terminated abnormally");
            }
        }
        tracing::info!(topic = %self.topic, group = %self.group, "Consumer stopped");
        Ok(())
    }
}

/// Process one partition sequentially until cancelled or revoked.
///
/// Dropping the stream on return releases the partition; anything not yet
/// committed is replayed to whichever member owns it next.
pub async fn run_partition(
    dispatcher: Arc<Dispatcher>,
    mut stream: Box<dyn PartitionStream>,
    cancel: CancellationToken,
) {
    let partition = stream.partition();
    let topic = stream.topic().to_string();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = stream.recv() => received,
        };

        match received {
            Ok(Some(record)) => {
                let offset = record.offset;
                match dispatcher.process(stream.as_mut(), record, &cancel).await {
                    Ok(Disposition::Abandoned) => break,
                    Ok(_) => {}
                    Err(e) => {
                        // Commit or hand-back failed; the record stays
                        // uncommitted and the broker owns its fate.
                        tracing::error!(
                            %topic,
                            partition,
                            offset,
                            error = %e,
                            "Broker rejected acknowledgement, releasing partition",
                        );
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::info!(%topic, partition, "Partition closed by broker");
                break;
            }
            Err(e) => {
                tracing::warn!(%topic, partition, error = %e, "Receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    tracing::info!(%topic, partition, "Partition worker stopped");
}
