// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the channel traits, with the AMQP semantics
//! the scenarios rely on: direct/topic/fanout routing, idempotent declares,
//! precondition failures on conflicting redeclares, requeue and
//! dead-lettering through `x-dead-letter-exchange`.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::{AMQPValue, ShortString};
use peril_pubsub::{
    ack::Acknowledger,
    channel::{AmqpChannel, ChannelProvider, DeliveryStream, InboundDelivery, OutboundMessage},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{DeclaredQueue, QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Discard,
}

struct QueueState {
    def: QueueDefinition,
    backlog: VecDeque<StoredMessage>,
    consumer: Option<UnboundedSender<StoredMessage>>,
}

#[derive(Default)]
struct BrokerState {
    next_tag: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<(String, String, String)>,
    delivered: Vec<u64>,
    settlements: Vec<(u64, Settlement)>,
    prefetch: Vec<u16>,
    channels_opened: usize,
    refuse_channels: bool,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, mut message: StoredMessage) {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let Some(def) = self.exchanges.get(exchange) else {
                return;
            };
            let kind = def.exchange_kind();

            let mut targets = self
                .bindings
                .iter()
                .filter(|(ex, key, _)| {
                    ex == exchange
                        && match kind {
                            ExchangeKind::Direct => key == routing_key,
                            ExchangeKind::Topic => topic_matches(key, routing_key),
                            ExchangeKind::Fanout => true,
                        }
                })
                .map(|(_, _, queue)| queue.clone())
                .collect::<Vec<_>>();
            targets.sort();
            targets.dedup();
            targets
        };

        message.routing_key = routing_key.to_owned();
        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
    }

    fn enqueue(&mut self, queue: &str, mut message: StoredMessage) {
        self.next_tag += 1;
        message.tag = self.next_tag;

        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        let undelivered = match &state.consumer {
            Some(consumer) => consumer.send(message).err().map(|returned| returned.0),
            None => Some(message),
        };

        match undelivered {
            None => self.delivered.push(self.next_tag),
            Some(message) => {
                state.consumer = None;
                state.backlog.push_back(message);
            }
        }
    }

    fn dead_letter_exchange(&self, queue: &str) -> Option<String> {
        let def = &self.queues.get(queue)?.def;
        match def
            .arguments()
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
        {
            Some(AMQPValue::LongString(exchange)) => {
                Some(String::from_utf8_lossy(exchange.as_bytes()).into_owned())
            }
            _ => None,
        }
    }
}

/// Topic match where `*` is exactly one word and `#` zero or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                walk(&pattern[1..], key) || (!key.is_empty() && walk(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => walk(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => walk(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = key.split('.').collect::<Vec<_>>();
    walk(&pattern, &key)
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> Arc<dyn ChannelProvider> {
        Arc::new(self.clone())
    }

    /// Declares an exchange the way the server process does at startup.
    pub fn with_exchange(self, name: &str, kind: ExchangeKind) -> Self {
        self.state.lock().unwrap().exchanges.insert(
            name.to_owned(),
            ExchangeDefinition::new(name).kind(kind).durable(),
        );
        self
    }

    pub fn refuse_channels(&self) {
        self.state.lock().unwrap().refuse_channels = true;
    }

    /// Simulates a broker restart: consumers are dropped, only durable queues
    /// survive, together with their bindings and stored messages.
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap();
        state
            .queues
            .retain(|_, queue| queue.def.declare_options().durable);
        let queues = state.queues.keys().cloned().collect::<HashSet<_>>();
        state
            .bindings
            .retain(|(_, _, queue)| queues.contains(queue));
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        state.exchanges.retain(|_, def| def.is_durable());
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(queue)
    }

    pub fn backlog(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        let mut bindings = self
            .state
            .lock()
            .unwrap()
            .bindings
            .iter()
            .filter(|(_, _, q)| q == queue)
            .map(|(exchange, key, _)| (exchange.clone(), key.clone()))
            .collect::<Vec<_>>();
        bindings.sort();
        bindings
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn settlements(&self) -> Vec<(u64, Settlement)> {
        self.state.lock().unwrap().settlements.clone()
    }

    pub fn prefetch_requests(&self) -> Vec<u16> {
        self.state.lock().unwrap().prefetch.clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().unwrap().channels_opened
    }

    /// Publishes raw bytes, bypassing any codec.
    pub fn publish_raw(&self, exchange: &str, key: &str, payload: &[u8], content_type: &str) {
        let message = StoredMessage {
            tag: 0,
            payload: payload.to_vec(),
            content_type: Some(content_type.to_owned()),
            routing_key: key.to_owned(),
            redelivered: false,
            headers: BTreeMap::new(),
        };
        self.state.lock().unwrap().route(exchange, key, message);
    }
}

#[async_trait]
impl ChannelProvider for MemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_channels {
            return Err(AmqpError::ChannelError);
        }
        state.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        match state.exchanges.get(def.name()) {
            Some(existing)
                if existing.exchange_kind() != def.exchange_kind()
                    || existing.is_durable() != def.is_durable() =>
            {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        let mut state = self.state.lock().unwrap();
        let queue = state
            .queues
            .entry(def.name().to_owned())
            .or_insert_with(|| QueueState {
                def: def.clone(),
                backlog: VecDeque::new(),
                consumer: None,
            });

        if queue.def != *def {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        Ok(DeclaredQueue {
            name: def.name().to_owned(),
            message_count: queue.backlog.len() as u32,
            consumer_count: u32::from(queue.consumer.is_some()),
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        state.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
            binding.queue_name().to_owned(),
        ));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.state.lock().unwrap().prefetch.push(count);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !message.exchange.is_empty() && !state.exchanges.contains_key(&message.exchange) {
            return Err(AmqpError::PublishingError);
        }

        let stored = StoredMessage {
            tag: 0,
            payload: message.envelope.payload,
            content_type: Some(message.envelope.content_type),
            routing_key: message.routing_key.clone(),
            redelivered: false,
            headers: message.headers,
        };
        state.route(&message.exchange, &message.routing_key, stored);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = unbounded_channel();

        {
            let mut state = self.state.lock().unwrap();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };
            let backlog = queue_state.backlog.drain(..).collect::<Vec<_>>();
            queue_state.consumer = Some(tx.clone());
            for message in backlog {
                let tag = message.tag;
                if tx.send(message).is_ok() {
                    state.delivered.push(tag);
                }
            }
        }

        let shared = self.state.clone();
        let queue = queue.to_owned();
        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .map(move |message| {
            Ok(InboundDelivery {
                payload: message.payload.clone(),
                content_type: message.content_type.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                headers: message.headers.clone(),
                acker: Box::new(MemoryAcker {
                    state: shared.clone(),
                    queue: queue.clone(),
                    message,
                    settled: Mutex::new(false),
                }) as Box<dyn Acknowledger>,
            })
        });

        Ok(deliveries.boxed())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    message: StoredMessage,
    settled: Mutex<bool>,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<(), AmqpError> {
        let mut settled = self.settled.lock().unwrap();
        if *settled {
            // A second settle on one delivery tag is a channel error in AMQP.
            return Err(match settlement {
                Settlement::Ack => AmqpError::AckMessageError,
                _ => AmqpError::NackMessageError,
            });
        }
        *settled = true;

        let mut state = self.state.lock().unwrap();
        state.settlements.push((self.message.tag, settlement));

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                let mut message = self.message.clone();
                message.redelivered = true;
                state.enqueue(&self.queue, message);
            }
            Settlement::Discard => {
                if let Some(exchange) = state.dead_letter_exchange(&self.queue) {
                    let message = self.message.clone();
                    let key = message.routing_key.clone();
                    state.route(&exchange, &key, message);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        })
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
