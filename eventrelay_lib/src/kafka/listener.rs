use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use rdkafka::client::ClientContext;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Message as KafkaMessage};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::kafka::KafkaSettings;
use crate::stream::{
    BatchOutcome, CloseReason, Message, PartitionContext, PartitionProcessor, ProcessorHandle, StreamSource,
};
use crate::util::error::{CheckpointError, PartitionError, SubscriptionError};

type RelayConsumer = StreamConsumer<RelayContext>;
type ConsumerSlot = Arc<RwLock<Option<Arc<RelayConsumer>>>>;

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct KafkaSourceOptions {
    /// Most messages handed over in a single batch.
    pub max_batch_size: usize,
    /// Messages queued per partition before it gets paused.
    pub partition_buffer: usize,
    /// How often the assignment is compared against the open partitions, on top of rebalance callbacks.
    pub assignment_poll_interval: Duration,
    pub metadata_timeout: Duration,
    /// Pause before redelivering a batch the handler failed on, and between rewind attempts.
    pub redelivery_delay: Duration,
    pub seek_timeout: Duration,
    /// Rewind attempts before a partition is given up until it gets reassigned.
    pub seek_attempts: usize,
}

impl Default for KafkaSourceOptions {
    fn default() -> Self {
        KafkaSourceOptions {
            max_batch_size: 100,
            partition_buffer: 1000,
            assignment_poll_interval: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(10),
            redelivery_delay: Duration::from_secs(1),
            seek_timeout: Duration::from_secs(10),
            seek_attempts: 5,
        }
    }
}

/// Client events the dispatcher acts on, in the order librdkafka reported them.
#[derive(Debug)]
enum ClientEvent {
    Error(KafkaError),
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
}

/// Client context that forwards errors and rebalances to the dispatcher and logs commit results.
pub struct RelayContext {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl RelayContext {
    fn forward(&self, event: ClientEvent) {
        // the dispatcher is gone once we are shutting down
        let _ = self.events.send(event);
    }
}

impl ClientContext for RelayContext {
    fn error(&self, error: KafkaError, reason: &str) {
        error!("Kafka client error: {} ({})", error, reason);
        self.forward(ClientEvent::Error(error));
    }
}

impl ConsumerContext for RelayContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.forward(ClientEvent::Revoked(partition_ids(partitions))),
            Rebalance::Error(e) => self.forward(ClientEvent::Error(e.clone())),
            Rebalance::Assign(_) => {}
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Assign(partitions) = rebalance {
            self.forward(ClientEvent::Assigned(partition_ids(partitions)));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        // failures reach the caller of `checkpoint` as well
        match result {
            Ok(()) => trace!("Committed offsets: {:?}", offsets),
            Err(e) => debug!("Commit of {:?} failed: {}", offsets, e),
        }
    }
}

fn partition_ids(partitions: &TopicPartitionList) -> Vec<(String, i32)> {
    partitions
        .elements()
        .iter()
        .map(|element| (element.topic().to_string(), element.partition()))
        .collect()
}

/// Consumes a topic through a consumer group, one worker task per assigned partition.
/// Offsets are only committed through [`StreamSource::checkpoint`].
pub struct KafkaSource {
    settings: KafkaSettings,
    options: KafkaSourceOptions,
    owner: Uuid,
    consumer: ConsumerSlot,
}

impl KafkaSource {
    pub fn new(settings: KafkaSettings, options: KafkaSourceOptions) -> Self {
        KafkaSource {
            settings,
            options,
            owner: Uuid::new_v4(),
            consumer: Arc::new(RwLock::new(None)),
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

#[async_trait]
impl StreamSource for KafkaSource {
    async fn subscribe(
        &self,
        stream_name: &str,
        group_id: &str,
        processor: Arc<dyn PartitionProcessor>,
    ) -> Result<Box<dyn ProcessorHandle>, SubscriptionError> {
        if self.consumer.read().is_some() {
            return Err(SubscriptionError::AlreadyStarted);
        }

        let (events_sender, events) = mpsc::unbounded_channel();
        let consumer: RelayConsumer = self
            .settings
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("allow.auto.create.topics", "false")
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .create_with_context(RelayContext { events: events_sender })?;
        let consumer = Arc::new(consumer);

        let partitions = resolve_stream(consumer.clone(), stream_name, self.options.metadata_timeout).await?;
        consumer.subscribe(&[stream_name])?;
        info!(
            "Subscribed to '{}' ({} partitions) as consumer group '{}'",
            stream_name, partitions, group_id
        );
        *self.consumer.write() = Some(consumer.clone());

        let token = CancellationToken::new();
        let (requests_sender, requests) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            consumer,
            processor,
            stream_name: stream_name.to_string(),
            group_id: group_id.to_string(),
            owner: self.owner,
            options: self.options.clone(),
            requests: requests_sender,
            workers: HashMap::new(),
            fenced: HashSet::new(),
            retired: Vec::new(),
            next_worker: 0,
        };
        let task = tokio::spawn(dispatcher.run(events, requests, token.clone(), self.consumer.clone()));

        Ok(Box::new(KafkaProcessorHandle {
            token,
            task: Mutex::new(Some(task)),
        }))
    }

    async fn checkpoint(&self, context: &PartitionContext, offset: i64) -> Result<(), CheckpointError> {
        let consumer = self.consumer.read().clone().ok_or(CheckpointError::NotSubscribed)?;
        let partition: i32 = context
            .partition_id
            .parse()
            .map_err(|_| CheckpointError::InvalidPartition(context.partition_id.clone()))?;
        let topic = context.stream_name.clone();

        // sync, so a commit the broker rejects fails the checkpoint
        tokio::task::spawn_blocking(move || {
            // kafka stores the next offset to read, not the last one handled
            let mut offsets = TopicPartitionList::new();
            offsets.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))?;
            consumer.commit(&offsets, CommitMode::Sync)
        })
        .await
        .map_err(|e| CheckpointError::Rejected(e.to_string()))??;

        Ok(())
    }
}

async fn resolve_stream(
    consumer: Arc<RelayConsumer>,
    stream_name: &str,
    timeout: Duration,
) -> Result<usize, SubscriptionError> {
    let topic = stream_name.to_string();
    let partitions = tokio::task::spawn_blocking(move || {
        consumer.fetch_metadata(Some(topic.as_str()), timeout).map(|metadata| {
            metadata
                .topics()
                .iter()
                .find(|found| found.name() == topic && found.error().is_none())
                .map(|found| found.partitions().len())
                .unwrap_or_default()
        })
    })
    .await
    .map_err(|e| SubscriptionError::Metadata(e.to_string()))??;

    if partitions == 0 {
        return Err(SubscriptionError::UnknownStream(stream_name.to_string()));
    }
    Ok(partitions)
}

struct KafkaProcessorHandle {
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ProcessorHandle for KafkaProcessorHandle {
    async fn unregister(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Kafka dispatcher task failed: {}", e);
            }
        }
    }
}

/// A message tagged with the seek epoch it was fetched in.
#[derive(Debug)]
struct Delivery {
    epoch: u64,
    message: Message,
}

/// Dispatcher side of a partition channel. Messages that don't fit are parked in offset order, and
/// the partition stays paused on the broker until the parked messages are through.
struct PartitionQueue {
    sender: mpsc::Sender<Delivery>,
    parked: VecDeque<Message>,
    paused: bool,
    epoch: u64,
}

impl PartitionQueue {
    fn new(sender: mpsc::Sender<Delivery>) -> Self {
        PartitionQueue {
            sender,
            parked: VecDeque::new(),
            paused: false,
            epoch: 0,
        }
    }

    /// Returns true when the partition just got backed up and has to be paused.
    fn offer(&mut self, message: Message) -> bool {
        if self.parked.is_empty() {
            let delivery = Delivery {
                epoch: self.epoch,
                message,
            };
            match self.sender.try_send(delivery) {
                Ok(()) => return false,
                Err(TrySendError::Full(delivery)) => self.parked.push_back(delivery.message),
                // worker is gone, nobody will read this anyway
                Err(TrySendError::Closed(_)) => return false,
            }
        } else {
            self.parked.push_back(message);
        }

        !mem::replace(&mut self.paused, true)
    }

    /// Moves parked messages into the channel. Returns true when the partition caught up and can be resumed.
    fn pump(&mut self) -> bool {
        while let Some(message) = self.parked.pop_front() {
            let delivery = Delivery {
                epoch: self.epoch,
                message,
            };
            match self.sender.try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(delivery)) => {
                    self.parked.push_front(delivery.message);
                    return false;
                }
                Err(TrySendError::Closed(_)) => self.parked.clear(),
            }
        }

        mem::replace(&mut self.paused, false)
    }

    /// Starts a new epoch after a seek. Parked messages are dropped here, queued ones by the worker.
    /// Returns the new epoch and whether the partition has to be resumed.
    fn rewind(&mut self) -> (u64, bool) {
        self.epoch += 1;
        self.parked.clear();
        (self.epoch, mem::replace(&mut self.paused, false))
    }
}

/// Collects a batch of at most `max` messages, starting with `first`, skipping anything fetched
/// before `epoch`. Comes back empty when everything queued was stale.
fn take_batch(first: Delivery, messages: &mut mpsc::Receiver<Delivery>, max: usize, epoch: u64) -> Vec<Message> {
    let mut batch = Vec::with_capacity(max);
    let mut next = Some(first);
    while let Some(delivery) = next {
        if delivery.epoch >= epoch {
            batch.push(delivery.message);
        }
        if batch.len() >= max {
            break;
        }
        next = messages.try_recv().ok();
    }
    batch
}

/// Requests a partition worker makes to the dispatcher, which owns the consumer.
enum WorkerRequest {
    Rewind {
        partition: i32,
        worker: u64,
        offset: i64,
        reply: oneshot::Sender<KafkaResult<u64>>,
    },
    /// The worker gave up on its partition after failing to rewind it.
    Abandon { partition: i32, worker: u64 },
}

struct PartitionWorker {
    id: u64,
    queue: PartitionQueue,
    close: oneshot::Sender<CloseReason>,
    task: JoinHandle<()>,
}

impl PartitionWorker {
    fn close(self, reason: CloseReason) -> JoinHandle<()> {
        // the worker may already be gone, in which case there is nobody to tell
        let _ = self.close.send(reason);
        self.task
    }
}

struct Dispatcher {
    consumer: Arc<RelayConsumer>,
    processor: Arc<dyn PartitionProcessor>,
    stream_name: String,
    group_id: String,
    owner: Uuid,
    options: KafkaSourceOptions,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    workers: HashMap<i32, PartitionWorker>,
    // partitions that couldn't be rewound, left paused until they get reassigned
    fenced: HashSet<i32>,
    // closed workers that may still be finishing their last batch
    retired: Vec<JoinHandle<()>>,
    next_worker: u64,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
        mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
        token: CancellationToken,
        slot: ConsumerSlot,
    ) {
        let consumer = self.consumer.clone();
        let stream_context = PartitionContext::stream_wide(&self.stream_name, &self.group_id, self.owner);

        let mut assignment_ticker = time::interval(self.options.assignment_poll_interval);
        assignment_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pump_ticker = time::interval(PUMP_INTERVAL);
        pump_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let parked = self.workers.values().any(|worker| !worker.queue.parked.is_empty());

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(event) = events.recv() => match event {
                    ClientEvent::Error(e) => {
                        self.processor.on_error(&stream_context, PartitionError::Kafka(e)).await;
                    }
                    ClientEvent::Assigned(partitions) => self.assign(partitions),
                    ClientEvent::Revoked(partitions) => self.revoke(partitions),
                },
                Some(request) = requests.recv() => self.handle_request(request).await,
                _ = assignment_ticker.tick() => self.reconcile_assignment(),
                _ = pump_ticker.tick(), if parked => self.pump_parked(),
                received = receive(&consumer) => match received {
                    Ok((partition, message)) => self.route(partition, message),
                    Err(e) => self.processor.on_error(&stream_context, PartitionError::Kafka(e)).await,
                },
            }
        }

        debug!("Dispatcher for '{}' stopping", self.stream_name);
        // workers waiting on a rewind see their reply dropped
        drop(requests);
        self.shutdown().await;
        *slot.write() = None;
    }

    fn route(&mut self, partition: i32, message: Message) {
        if self.fenced.contains(&partition) {
            trace!("Dropping offset {} of fenced partition {}", message.offset, partition);
            return;
        }

        if !self.workers.contains_key(&partition) {
            let worker = self.spawn_worker(partition);
            self.workers.insert(partition, worker);
        }

        if let Some(worker) = self.workers.get_mut(&partition) {
            if worker.queue.offer(message) {
                debug!("Partition {} is backed up, pausing it", partition);
                set_paused(&self.consumer, &self.stream_name, partition, true);
            }
        }
    }

    fn pump_parked(&mut self) {
        for (partition, worker) in self.workers.iter_mut() {
            if !worker.queue.parked.is_empty() && worker.queue.pump() {
                debug!("Partition {} caught up, resuming it", partition);
                set_paused(&self.consumer, &self.stream_name, *partition, false);
            }
        }
    }

    async fn handle_request(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Rewind {
                partition,
                worker,
                offset,
                reply,
            } => {
                let result = self.rewind(partition, worker, offset).await;
                // the worker may have been closed in the meantime
                let _ = reply.send(result);
            }
            WorkerRequest::Abandon { partition, worker } => {
                if !self.is_current(partition, worker) {
                    return;
                }
                if let Some(worker) = self.workers.remove(&partition) {
                    warn!(
                        "Fencing partition {} of '{}' until it is reassigned",
                        partition, self.stream_name
                    );
                    set_paused(&self.consumer, &self.stream_name, partition, true);
                    self.fenced.insert(partition);
                    self.retired.push(worker.task);
                }
            }
        }
    }

    async fn rewind(&mut self, partition: i32, worker: u64, offset: i64) -> KafkaResult<u64> {
        if !self.is_current(partition, worker) {
            return Err(KafkaError::Seek(format!("partition {} was reassigned", partition)));
        }

        // nothing is received while seeking, so everything routed afterwards is from the new position
        seek(
            self.consumer.clone(),
            &self.stream_name,
            partition,
            offset,
            self.options.seek_timeout,
        )
        .await?;

        let worker = self
            .workers
            .get_mut(&partition)
            .ok_or_else(|| KafkaError::Seek(format!("partition {} is not open", partition)))?;
        let (epoch, resume) = worker.queue.rewind();
        if resume {
            set_paused(&self.consumer, &self.stream_name, partition, false);
        }
        debug!("Rewound partition {} to offset {} (epoch {})", partition, offset, epoch);
        Ok(epoch)
    }

    fn is_current(&self, partition: i32, worker: u64) -> bool {
        self.workers
            .get(&partition)
            .map(|current| current.id == worker)
            .unwrap_or(false)
    }

    fn assign(&mut self, partitions: Vec<(String, i32)>) {
        for (topic, partition) in partitions {
            if topic != self.stream_name {
                continue;
            }
            if self.fenced.remove(&partition) {
                set_paused(&self.consumer, &self.stream_name, partition, false);
            }
            if !self.workers.contains_key(&partition) {
                info!("Partition {} of '{}' was assigned to us", partition, self.stream_name);
                let worker = self.spawn_worker(partition);
                self.workers.insert(partition, worker);
            }
        }
    }

    fn revoke(&mut self, partitions: Vec<(String, i32)>) {
        for (topic, partition) in partitions {
            if topic != self.stream_name {
                continue;
            }
            self.fenced.remove(&partition);
            if let Some(worker) = self.workers.remove(&partition) {
                info!("Partition {} of '{}' is no longer assigned to us", partition, self.stream_name);
                self.retired.push(worker.close(CloseReason::LeaseLost));
            }
        }
    }

    /// Catches assignment changes no rebalance callback reported.
    fn reconcile_assignment(&mut self) {
        self.retired.retain(|task| !task.is_finished());

        let assignment = match self.consumer.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!("Failed to fetch partition assignment: {}", e);
                return;
            }
        };

        let assigned: HashSet<i32> = assignment
            .elements()
            .iter()
            .filter(|element| element.topic() == self.stream_name)
            .map(|element| element.partition())
            .collect();

        self.fenced.retain(|partition| assigned.contains(partition));
        for partition in &assigned {
            if !self.workers.contains_key(partition) && !self.fenced.contains(partition) {
                let worker = self.spawn_worker(*partition);
                self.workers.insert(*partition, worker);
            }
        }

        let revoked: Vec<(String, i32)> = self
            .workers
            .keys()
            .filter(|partition| !assigned.contains(*partition))
            .map(|partition| (self.stream_name.clone(), *partition))
            .collect();
        self.revoke(revoked);
    }

    fn spawn_worker(&mut self, partition: i32) -> PartitionWorker {
        let (sender, messages) = mpsc::channel(self.options.partition_buffer.max(1));
        let (close, close_signal) = oneshot::channel();
        let context = PartitionContext::new(&self.stream_name, &self.group_id, partition.to_string(), self.owner);
        let id = self.next_worker;
        self.next_worker += 1;

        let task = tokio::spawn(run_partition(
            PartitionTask {
                context,
                partition,
                worker: id,
                processor: self.processor.clone(),
                requests: self.requests.clone(),
                options: self.options.clone(),
            },
            messages,
            close_signal,
        ));

        PartitionWorker {
            id,
            queue: PartitionQueue::new(sender),
            close,
            task,
        }
    }

    async fn shutdown(mut self) {
        for (_, worker) in self.workers.drain() {
            self.retired.push(worker.close(CloseReason::Shutdown));
        }
        for task in self.retired.drain(..) {
            if let Err(e) = task.await {
                error!("Partition worker failed: {}", e);
            }
        }
        self.consumer.unsubscribe();
    }
}

struct PartitionTask {
    context: PartitionContext,
    partition: i32,
    worker: u64,
    processor: Arc<dyn PartitionProcessor>,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    options: KafkaSourceOptions,
}

impl PartitionTask {
    /// Asks the dispatcher to move the partition back to `offset`, retrying failed seeks. The error is
    /// the reason to close the partition with.
    async fn rewind(&self, offset: i64, close_signal: &mut oneshot::Receiver<CloseReason>) -> Result<u64, CloseReason> {
        let attempts = self.options.seek_attempts.max(1);
        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                reason = &mut *close_signal => return Err(reason.unwrap_or(CloseReason::Shutdown)),
                _ = time::sleep(self.options.redelivery_delay) => {}
            }

            let (reply, response) = oneshot::channel();
            let request = WorkerRequest::Rewind {
                partition: self.partition,
                worker: self.worker,
                offset,
                reply,
            };
            if self.requests.send(request).is_err() {
                return Err(CloseReason::Shutdown);
            }

            let result = tokio::select! {
                biased;
                reason = &mut *close_signal => return Err(reason.unwrap_or(CloseReason::Shutdown)),
                result = response => result,
            };
            match result {
                Ok(Ok(epoch)) => return Ok(epoch),
                Ok(Err(e)) => {
                    warn!(
                        "Failed to rewind {} to offset {} (attempt {}/{}): {}",
                        self.context, offset, attempt, attempts, e
                    );
                    self.processor.on_error(&self.context, PartitionError::Kafka(e)).await;
                }
                // dispatcher is shutting down
                Err(_) => return Err(CloseReason::Shutdown),
            }
        }

        error!(
            "Giving up on {}, offset {} and later stay uncommitted until the partition is reassigned",
            self.context, offset
        );
        Err(CloseReason::TransportError)
    }
}

async fn run_partition(
    task: PartitionTask,
    mut messages: mpsc::Receiver<Delivery>,
    mut close_signal: oneshot::Receiver<CloseReason>,
) {
    let context = &task.context;
    task.processor.on_partition_opened(context).await;

    let mut epoch = 0;
    let reason = loop {
        let first = tokio::select! {
            biased;
            reason = &mut close_signal => break reason.unwrap_or(CloseReason::Shutdown),
            received = messages.recv() => match received {
                Some(delivery) => delivery,
                None => break CloseReason::Shutdown,
            },
        };

        let batch = take_batch(first, &mut messages, task.options.max_batch_size.max(1), epoch);
        if batch.is_empty() {
            continue;
        }

        // nothing past `resume_from` gets handled until the partition is rewound
        if let BatchOutcome::Interrupted { resume_from } = task.processor.on_messages(context, batch).await {
            match task.rewind(resume_from, &mut close_signal).await {
                Ok(rewound) => epoch = rewound,
                Err(reason) => break reason,
            }
        }
    };

    if reason == CloseReason::TransportError {
        let _ = task.requests.send(WorkerRequest::Abandon {
            partition: task.partition,
            worker: task.worker,
        });
    }
    task.processor.on_partition_closed(context, reason).await;
}

async fn seek(
    consumer: Arc<RelayConsumer>,
    topic: &str,
    partition: i32,
    offset: i64,
    timeout: Duration,
) -> KafkaResult<()> {
    let topic = topic.to_string();
    tokio::task::spawn_blocking(move || consumer.seek(&topic, partition, Offset::Offset(offset), timeout))
        .await
        .unwrap_or_else(|e| Err(KafkaError::Seek(e.to_string())))
}

fn set_paused(consumer: &RelayConsumer, topic: &str, partition: i32, paused: bool) {
    let mut partitions = TopicPartitionList::new();
    partitions.add_partition(topic, partition);
    let result = if paused {
        consumer.pause(&partitions)
    } else {
        consumer.resume(&partitions)
    };
    if let Err(e) = result {
        warn!("Failed to change pause state of partition {}: {}", partition, e);
    }
}

// converts before returning so no borrowed message is held across an await
async fn receive(consumer: &RelayConsumer) -> KafkaResult<(i32, Message)> {
    let message = consumer.recv().await?;
    Ok((message.partition(), convert_message(&message)))
}

fn convert_message(message: &BorrowedMessage<'_>) -> Message {
    let mut converted = Message::new(
        message.partition().to_string(),
        message.offset(),
        message.payload().unwrap_or_default(),
    );
    if let Some(key) = message.key() {
        converted = converted.with_key(key);
    }
    if let Some(enqueued_at) = message
        .timestamp()
        .to_millis()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    {
        converted = converted.with_enqueued_at(enqueued_at);
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: i64) -> Message {
        Message::new("0", offset, "PITCH")
    }

    fn drain(messages: &mut mpsc::Receiver<Delivery>) -> Vec<(u64, i64)> {
        let mut drained = Vec::new();
        while let Ok(delivery) = messages.try_recv() {
            drained.push((delivery.epoch, delivery.message.offset));
        }
        drained
    }

    fn offsets(batch: &[Message]) -> Vec<i64> {
        batch.iter().map(|message| message.offset).collect()
    }

    #[test]
    fn full_channel_parks_and_pauses_once() {
        let (sender, mut messages) = mpsc::channel(2);
        let mut queue = PartitionQueue::new(sender);

        assert!(!queue.offer(message(1)));
        assert!(!queue.offer(message(2)));
        assert!(queue.offer(message(3)));
        assert!(!queue.offer(message(4)));
        assert!(queue.paused);
        assert_eq!(queue.parked.len(), 2);

        // room in the channel doesn't let a newer message overtake the parked ones
        assert_eq!(drain(&mut messages), vec![(0, 1), (0, 2)]);
        assert!(!queue.offer(message(5)));
        assert_eq!(queue.parked.len(), 3);
    }

    #[test]
    fn parked_messages_keep_offset_order() {
        let (sender, mut messages) = mpsc::channel(2);
        let mut queue = PartitionQueue::new(sender);
        for offset in 1..=5 {
            queue.offer(message(offset));
        }

        let mut received = drain(&mut messages);
        assert!(!queue.pump());
        received.extend(drain(&mut messages));
        assert!(queue.pump());
        assert!(!queue.paused);
        received.extend(drain(&mut messages));

        let received: Vec<i64> = received.into_iter().map(|(_, offset)| offset).collect();
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn batches_are_capped() {
        let (sender, mut messages) = mpsc::channel(10);
        let mut queue = PartitionQueue::new(sender);
        for offset in 1..=5 {
            queue.offer(message(offset));
        }

        let first = messages.try_recv().unwrap();
        let batch = take_batch(first, &mut messages, 3, 0);
        assert_eq!(offsets(&batch), vec![1, 2, 3]);
        assert_eq!(drain(&mut messages), vec![(0, 4), (0, 5)]);
    }

    #[test]
    fn rewind_drops_messages_fetched_before_the_seek() {
        let (sender, mut messages) = mpsc::channel(2);
        let mut queue = PartitionQueue::new(sender);
        for offset in 3..=5 {
            queue.offer(message(offset));
        }

        let (epoch, resume) = queue.rewind();
        assert_eq!(epoch, 1);
        assert!(resume);
        assert!(queue.parked.is_empty());

        let first = messages.try_recv().unwrap();
        assert!(take_batch(first, &mut messages, 10, epoch).is_empty());

        // offset 3 was compacted away, the new epoch picks up wherever the broker resumes
        queue.offer(message(7));
        queue.offer(message(8));
        let first = messages.try_recv().unwrap();
        let batch = take_batch(first, &mut messages, 10, epoch);
        assert_eq!(offsets(&batch), vec![7, 8]);
    }

    #[test]
    fn stale_messages_do_not_count_towards_the_cap() {
        let (sender, mut messages) = mpsc::channel(10);
        let mut queue = PartitionQueue::new(sender);
        queue.offer(message(3));
        queue.offer(message(4));
        queue.rewind();
        queue.offer(message(3));
        queue.offer(message(4));
        queue.offer(message(5));

        let first = messages.try_recv().unwrap();
        let batch = take_batch(first, &mut messages, 2, 1);
        assert_eq!(offsets(&batch), vec![3, 4]);
        assert_eq!(drain(&mut messages), vec![(1, 5)]);
    }

    /// Interrupts the first batch at its first offset, completes every later one.
    #[derive(Default)]
    struct InterruptOnce {
        batches: Mutex<Vec<Vec<i64>>>,
        errors: Mutex<usize>,
        closed: Mutex<Option<CloseReason>>,
    }

    #[async_trait]
    impl PartitionProcessor for InterruptOnce {
        async fn on_partition_opened(&self, _context: &PartitionContext) {}

        async fn on_partition_closed(&self, _context: &PartitionContext, reason: CloseReason) {
            *self.closed.lock() = Some(reason);
        }

        async fn on_messages(&self, _context: &PartitionContext, batch: Vec<Message>) -> BatchOutcome {
            let mut batches = self.batches.lock();
            batches.push(offsets(&batch));
            if batches.len() == 1 {
                BatchOutcome::Interrupted {
                    resume_from: batch[0].offset,
                }
            } else {
                BatchOutcome::Completed { checkpointed: true }
            }
        }

        async fn on_error(&self, _context: &PartitionContext, _error: PartitionError) {
            *self.errors.lock() += 1;
        }
    }

    struct Worker {
        processor: Arc<InterruptOnce>,
        deliveries: mpsc::Sender<Delivery>,
        requests: mpsc::UnboundedReceiver<WorkerRequest>,
        _close: oneshot::Sender<CloseReason>,
        task: JoinHandle<()>,
    }

    fn spawn_test_worker(options: KafkaSourceOptions) -> Worker {
        let processor = Arc::new(InterruptOnce::default());
        let (deliveries, messages) = mpsc::channel(16);
        let (requests_sender, requests) = mpsc::unbounded_channel();
        let (close, close_signal) = oneshot::channel();
        let task = tokio::spawn(run_partition(
            PartitionTask {
                context: PartitionContext::new("baseball-events", "eventrelay", "0", Uuid::nil()),
                partition: 0,
                worker: 7,
                processor: processor.clone(),
                requests: requests_sender,
                options,
            },
            messages,
            close_signal,
        ));
        Worker {
            processor,
            deliveries,
            requests,
            _close: close,
            task,
        }
    }

    async fn deliver(worker: &Worker, epoch: u64, offset: i64) {
        worker.deliveries.send(Delivery { epoch, message: message(offset) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_seeks_close_the_partition_without_handling_more() {
        let mut worker = spawn_test_worker(KafkaSourceOptions {
            seek_attempts: 3,
            ..KafkaSourceOptions::default()
        });
        deliver(&worker, 0, 10).await;

        for _ in 0..3 {
            match worker.requests.recv().await {
                Some(WorkerRequest::Rewind {
                    worker: 7,
                    offset: 10,
                    reply,
                    ..
                }) => {
                    // later messages keep arriving while the seek fails
                    deliver(&worker, 0, 11).await;
                    reply.send(Err(KafkaError::Seek("broker unavailable".to_string()))).unwrap();
                }
                _ => panic!("expected a rewind request"),
            }
        }

        assert!(matches!(
            worker.requests.recv().await,
            Some(WorkerRequest::Abandon { partition: 0, worker: 7 })
        ));
        worker.task.await.unwrap();

        assert_eq!(*worker.processor.batches.lock(), vec![vec![10]]);
        assert_eq!(*worker.processor.errors.lock(), 3);
        assert_eq!(*worker.processor.closed.lock(), Some(CloseReason::TransportError));
    }

    #[tokio::test(start_paused = true)]
    async fn rewound_partition_skips_stale_deliveries() {
        let mut worker = spawn_test_worker(KafkaSourceOptions::default());
        deliver(&worker, 0, 10).await;

        match worker.requests.recv().await {
            Some(WorkerRequest::Rewind { offset: 10, reply, .. }) => {
                deliver(&worker, 0, 11).await;
                reply.send(Ok(1)).unwrap();
            }
            _ => panic!("expected a rewind request"),
        }
        // offset 10 is gone from the log, the broker resumes at 12
        deliver(&worker, 1, 12).await;
        deliver(&worker, 1, 13).await;

        time::sleep(Duration::from_millis(10)).await;
        let handled: Vec<i64> = worker.processor.batches.lock().concat();
        assert_eq!(handled, vec![10, 12, 13]);
        assert_eq!(*worker.processor.errors.lock(), 0);

        drop(worker.deliveries);
        worker.task.await.unwrap();
        assert_eq!(*worker.processor.closed.lock(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn rebalance_lists_keep_topic_and_partition() {
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition("baseball-events", 0);
        partitions.add_partition("baseball-events", 3);
        partitions.add_partition("other", 1);

        assert_eq!(
            partition_ids(&partitions),
            vec![
                ("baseball-events".to_string(), 0),
                ("baseball-events".to_string(), 3),
                ("other".to_string(), 1),
            ]
        );
    }
}
