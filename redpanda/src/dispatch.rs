//! Routing of consumed messages to per-partition workers.
//!
//! The dispatcher owns the consumer stream. Each `(topic, partition)` gets a
//! bounded lane and a worker task; the worker runs the handler, retries it in
//! place on failure and commits `offset + 1` only after success. A full lane
//! pauses its partition at the broker and parks further messages in order
//! until the worker catches up.

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use stockflow_core::channel::{Delivery, DeliveryHandler, Message};
use stockflow_core::shutdown::ShutdownSignal;
use stockflow_runtime::RetryPolicy;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

const UNPARK_INTERVAL: Duration = Duration::from_millis(50);

type LaneKey = (String, i32);

struct Lane {
    sender: mpsc::Sender<Delivery>,
    parked: VecDeque<Delivery>,
    paused: bool,
    worker: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
    consumer: Arc<StreamConsumer>,
    handler: Arc<dyn DeliveryHandler>,
    buffer: usize,
    redelivery: RetryPolicy,
    shutdown: ShutdownSignal,
    lanes: HashMap<LaneKey, Lane>,
}

impl Dispatcher {
    pub(crate) fn new(
        consumer: Arc<StreamConsumer>,
        handler: Arc<dyn DeliveryHandler>,
        buffer: usize,
        redelivery: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            consumer,
            handler,
            buffer,
            redelivery,
            shutdown,
            lanes: HashMap::new(),
        }
    }

    /// Consume until shutdown, then wait for every worker to finish its
    /// current message.
    pub(crate) async fn run(mut self) {
        let consumer = Arc::clone(&self.consumer);
        let mut stream = consumer.stream();
        let mut shutdown = self.shutdown.clone();
        let mut unpark = tokio::time::interval(UNPARK_INTERVAL);
        unpark.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                _ = unpark.tick() => self.unpark(),
                next = stream.next() => match next {
                    Some(Ok(message)) => self.route(to_delivery(&message)),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to receive message");
                    },
                    None => break,
                },
            }
        }

        drop(stream);
        let lanes: Vec<Lane> = self.lanes.drain().map(|(_, lane)| lane).collect();
        for lane in lanes {
            drop(lane.sender);
            if let Err(e) = lane.worker.await {
                tracing::error!(error = %e, "Partition worker failed");
            }
        }
        tracing::debug!("Dispatcher exiting");
    }

    fn route(&mut self, delivery: Delivery) {
        let key = (delivery.topic.clone(), delivery.partition);
        if !self.lanes.contains_key(&key) {
            let lane = self.open_lane(&key);
            self.lanes.insert(key.clone(), lane);
        }
        let Some(lane) = self.lanes.get_mut(&key) else {
            return;
        };

        if !lane.parked.is_empty() {
            lane.parked.push_back(delivery);
            return;
        }
        match lane.sender.try_send(delivery) {
            Ok(()) => {},
            Err(TrySendError::Full(delivery)) => {
                lane.parked.push_back(delivery);
                if !lane.paused {
                    lane.paused = set_paused(&self.consumer, &key, true);
                }
            },
            Err(TrySendError::Closed(delivery)) => {
                tracing::warn!(
                    topic = %key.0,
                    partition = key.1,
                    offset = delivery.offset,
                    "Partition worker gone, message left uncommitted"
                );
            },
        }
    }

    fn unpark(&mut self) {
        for (key, lane) in &mut self.lanes {
            while let Some(delivery) = lane.parked.pop_front() {
                match lane.sender.try_send(delivery) {
                    Ok(()) => {},
                    Err(TrySendError::Full(delivery)) => {
                        lane.parked.push_front(delivery);
                        break;
                    },
                    Err(TrySendError::Closed(_)) => {
                        lane.parked.clear();
                        break;
                    },
                }
            }
            if lane.paused && lane.parked.is_empty() {
                lane.paused = !set_paused(&self.consumer, key, false);
            }
        }
    }

    fn open_lane(&self, key: &LaneKey) -> Lane {
        let (sender, receiver) = mpsc::channel(self.buffer);
        tracing::debug!(topic = %key.0, partition = key.1, "Starting partition worker");
        let worker = tokio::spawn(work(
            Arc::clone(&self.consumer),
            Arc::clone(&self.handler),
            receiver,
            self.redelivery.clone(),
            self.shutdown.clone(),
        ));
        Lane {
            sender,
            parked: VecDeque::new(),
            paused: false,
            worker,
        }
    }
}

/// Returns whether the pause/resume call succeeded.
fn set_paused(consumer: &StreamConsumer, key: &LaneKey, pause: bool) -> bool {
    let mut partitions = TopicPartitionList::new();
    partitions.add_partition(&key.0, key.1);
    let result = if pause {
        consumer.pause(&partitions)
    } else {
        consumer.resume(&partitions)
    };
    match result {
        Ok(()) => {
            tracing::debug!(topic = %key.0, partition = key.1, pause, "Partition flow changed");
            true
        },
        Err(e) => {
            tracing::warn!(topic = %key.0, partition = key.1, pause, error = %e, "Failed to change partition flow");
            false
        },
    }
}

async fn work(
    consumer: Arc<StreamConsumer>,
    handler: Arc<dyn DeliveryHandler>,
    mut receiver: mpsc::Receiver<Delivery>,
    redelivery: RetryPolicy,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.triggered() => None,
            delivery = receiver.recv() => delivery,
        };
        let Some(mut delivery) = next else {
            break;
        };
        if !deliver(handler.as_ref(), &mut delivery, &redelivery, &mut shutdown).await {
            break;
        }
        commit(&consumer, &delivery);
    }
}

/// Run the handler until it succeeds. Returns `false` if shutdown interrupted
/// the retries, in which case nothing is committed.
async fn deliver(
    handler: &dyn DeliveryHandler,
    delivery: &mut Delivery,
    redelivery: &RetryPolicy,
    shutdown: &mut ShutdownSignal,
) -> bool {
    loop {
        let Err(e) = handler.handle(delivery).await else {
            return true;
        };

        let step = usize::try_from(delivery.attempt.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .min(redelivery.max_retries);
        let delay = redelivery.backoff(step);
        metrics::counter!("stockflow_channel_redeliveries_total").increment(1);
        tracing::warn!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            attempt = delivery.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %e,
            "Handler failed, redelivering"
        );

        tokio::select! {
            biased;
            () = shutdown.triggered() => return false,
            () = tokio::time::sleep(delay) => {},
        }
        delivery.attempt += 1;
    }
}

fn commit(consumer: &StreamConsumer, delivery: &Delivery) {
    let mut offsets = TopicPartitionList::new();
    if let Err(e) = offsets.add_partition_offset(
        &delivery.topic,
        delivery.partition,
        Offset::Offset(delivery.offset + 1),
    ) {
        tracing::error!(error = %e, "Invalid commit offset");
        return;
    }
    if let Err(e) = consumer.commit(&offsets, CommitMode::Async) {
        // Revoked partitions land here; the new owner redelivers.
        tracing::warn!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        attempt: 1,
        message: Message {
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default(),
            headers,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        },
    }
}
