//! TopicSource: one topic partition read as a [`SourceLog`].

use super::topic::Topic;
use super::TransportError;
use crate::event::{Position, RawChangeRecord, StartPosition};
use crate::pipeline::config::TransportConfig;
use crate::source::{ChangeStream, SourceError, SourceFuture, SourceLog};
use crate::store::SharedStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const READ_BATCH: usize = 512;

pub struct TopicSource {
    topic: Arc<Topic>,
    partition: u32,
    group: String,
    poll_interval: Duration,
}

impl TopicSource {
    pub(crate) fn new(topic: Arc<Topic>, partition: u32, group: impl Into<String>) -> Self {
        let poll_interval = topic.config().poll_interval;
        TopicSource {
            topic,
            partition,
            group: group.into(),
            poll_interval,
        }
    }

    /// Open the configured topic and subscribe to the configured partition.
    pub fn open(
        store: SharedStore,
        config: &TransportConfig,
        group: impl Into<String>,
    ) -> Result<Self, TransportError> {
        Topic::open(store, config)?.subscribe(config.partition, group)
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }
}

impl SourceLog for TopicSource {
    fn open_stream(&self, start: StartPosition) -> SourceFuture<'_, Box<dyn ChangeStream>> {
        Box::pin(async move {
            let manifest = self.topic.manifest(self.partition).await?;
            let after = match start {
                StartPosition::Earliest => None,
                StartPosition::Head => manifest.last_position,
                StartPosition::At(p) => {
                    if p > manifest.last_position.unwrap_or(Position::ZERO) {
                        return Err(SourceError::PositionAhead {
                            requested: p,
                            head: manifest.last_position,
                        });
                    }
                    // Partitions are sparse; only a dropped record past `p`
                    // means data is gone.
                    if let Some(dropped) = manifest.dropped_through {
                        if p < dropped {
                            return Err(SourceError::PositionLost {
                                requested: p,
                                earliest: manifest.earliest_position().unwrap_or(dropped.next()),
                            });
                        }
                    }
                    Some(p)
                }
            };
            debug!(
                topic = %self.topic.name(),
                partition = self.partition,
                group = %self.group,
                after = ?after,
                "Opened topic stream"
            );
            let stream: Box<dyn ChangeStream> = Box::new(TopicStream {
                topic: self.topic.clone(),
                partition: self.partition,
                poll_interval: self.poll_interval,
                after,
                pending: VecDeque::new(),
            });
            Ok(stream)
        })
    }

    fn current_head_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.topic.head(self.partition).await?) })
    }

    fn earliest_retained_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.topic.earliest(self.partition).await?) })
    }
}

struct TopicStream {
    topic: Arc<Topic>,
    partition: u32,
    poll_interval: Duration,
    after: Option<Position>,
    pending: VecDeque<RawChangeRecord>,
}

impl ChangeStream for TopicStream {
    fn next_record(&mut self) -> SourceFuture<'_, RawChangeRecord> {
        Box::pin(async move {
            loop {
                if let Some(record) = self.pending.pop_front() {
                    self.after = Some(record.position);
                    return Ok(record);
                }
                let topic = self.topic.clone();
                let notified = topic.published().notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch = self.topic.read(self.partition, self.after, READ_BATCH).await?;
                if !batch.is_empty() {
                    self.pending.extend(batch);
                    continue;
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        })
    }
}
