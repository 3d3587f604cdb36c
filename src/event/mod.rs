//! In-process bus carrying lifecycle events from the facade to the processors.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
    sync::{Arc, OnceLock, RwLock},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    model::{Instance, ServiceBinding},
    Error, Result,
};

/// Messages buffered before publishers have to wait.
pub const CHANNEL_CAPACITY: usize = 1024;

pub const BINDING_CHANNEL: &str = "servicebinding";
pub const INSTANCE_CHANNEL: &str = "serviceinstance";

/// What happened to the object carried by a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventOp {
    /// Replayed from the database at start.
    List,
    Create,
    Update,
    Delete,
}

impl EventOp {
    pub fn as_str(self) -> &'static str {
        match self {
            EventOp::List => "LIST",
            EventOp::Create => "CREATE",
            EventOp::Update => "UPDATE",
            EventOp::Delete => "DELETE",
        }
    }
}

impl Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventOp {
    type Err = Error;

    fn from_str(op: &str) -> Result<Self> {
        match op {
            "LIST" => Ok(EventOp::List),
            "CREATE" => Ok(EventOp::Create),
            "UPDATE" => Ok(EventOp::Update),
            "DELETE" => Ok(EventOp::Delete),
            other => Err(Error::ValidationError(format!("unsupported event op {other:?}"))),
        }
    }
}

/// A message on the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub op: String,
    pub payload: Vec<u8>,
    pub channel: String,
}

/// A decoded payload.
#[derive(Clone, Debug, PartialEq)]
pub enum EventObject {
    Binding(Box<ServiceBinding>),
    Instance(Box<Instance>),
}

impl EventObject {
    pub fn id(&self) -> &str {
        match self {
            EventObject::Binding(binding) => &binding.id,
            EventObject::Instance(instance) => &instance.id,
        }
    }
}

/// Turns a payload into the object a channel carries.
pub type Decoder = fn(&[u8]) -> Result<EventObject>;

pub fn decode_binding(payload: &[u8]) -> Result<EventObject> {
    Ok(EventObject::Binding(Box::new(serde_json::from_slice(payload)?)))
}

pub fn decode_instance(payload: &[u8]) -> Result<EventObject> {
    Ok(EventObject::Instance(Box::new(serde_json::from_slice(payload)?)))
}

/// Receives the decoded events of one channel.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, op: EventOp, object: EventObject) -> Result<()>;
}

struct Registration {
    decoder: Decoder,
    processor: Arc<dyn EventProcessor>,
}

/// Bounded bus shared by every publisher in the process.
#[derive(Default)]
pub struct EventBus {
    sender: OnceLock<mpsc::Sender<Message>>,
    registry: RwLock<HashMap<String, Arc<Registration>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages of `channel` through `decoder` into `processor`.
    pub fn register(&self, channel: &str, decoder: Decoder, processor: Arc<dyn EventProcessor>) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.insert(channel.to_string(), Arc::new(Registration { decoder, processor }));
    }

    /// Open the channel and dispatch until `stop` flips to true.
    pub fn start(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let (sender, mut receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.sender
            .set(sender)
            .map_err(|_| Error::ConfigError("event bus already started".into()))?;

        let bus = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = receiver.recv() => match message {
                        Some(message) => bus.dispatch(message).await,
                        None => break,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("event bus stopped");
        }))
    }

    async fn dispatch(&self, message: Message) {
        let registration = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.get(&message.channel).cloned()
        };
        let Some(registration) = registration else {
            warn!("dropping event for unknown channel {}", message.channel);
            return;
        };
        let op = match message.op.parse::<EventOp>() {
            Ok(op) => op,
            Err(e) => {
                warn!("dropping event on {}: {e}", message.channel);
                return;
            }
        };
        let object = match (registration.decoder)(&message.payload) {
            Ok(object) => object,
            Err(e) => {
                error!("cannot decode {op} event on {}: {e}", message.channel);
                return;
            }
        };
        if let Err(e) = registration.processor.process(op, object).await {
            error!("{op} event on {} failed: {e}", message.channel);
        }
    }

    /// Publish `object` on `channel`. Before the bus is started this does nothing.
    pub async fn add_event<T: Serialize>(&self, object: &T, op: EventOp, channel: &str) -> Result<()> {
        let message = Message {
            op: op.as_str().to_string(),
            payload: serde_json::to_vec(object)?,
            channel: channel.to_string(),
        };
        self.send(message).await
    }

    /// Publish a prepared message.
    pub async fn send(&self, message: Message) -> Result<()> {
        let Some(sender) = self.sender.get() else {
            debug!("event bus not started, dropping {} event", message.channel);
            return Ok(());
        };
        if sender.send(message).await.is_err() {
            warn!("event bus closed, event dropped");
        }
        Ok(())
    }
}
