//! Publish/subscribe router for interaction events
//!
//! The bus is an ordinary value constructed at startup and handed to every
//! component; there is no process-wide instance. Three delivery modes:
//!
//! - **Foreground**: synchronous, in the caller's thread, registration order
//! - **Background**: one fire-and-forget worker task per client
//! - **Gui**: queued on a broadcast channel and delivered by a [`GuiPump`]
//!   on the thread that owns the user interface
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::error::Result;
use crate::events::types::{DataEvent, Event};
use crate::execution::TaskRunner;

/// Capacity of the Gui channel; slower pumps lose the oldest events
const GUI_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    Foreground,
    Background,
    Gui,
}

/// A registered event consumer
pub trait EventClient: Send + Sync {
    fn process_event(&self, event: &Event, data: &DataEvent) -> Result<()>;

    /// Filter applied before `process_event`
    fn is_interesting(&self, event: &Event) -> bool {
        !event.is_key_event()
    }

    fn client_name(&self) -> &str {
        "client"
    }
}

type ClientList = Arc<RwLock<Vec<Arc<dyn EventClient>>>>;

pub struct EventBus {
    clients: ClientList,
    runner: Arc<TaskRunner>,
    data_event: RwLock<Arc<DataEvent>>,
    sequence: AtomicU64,
    gui: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("clients", &self.clients.read().len())
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .field("gui_subscribers", &self.gui.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        let (gui, _) = broadcast::channel(GUI_CHANNEL_CAPACITY);
        Self {
            clients: Arc::new(RwLock::new(Vec::new())),
            runner,
            data_event: RwLock::new(Arc::new(DataEvent::default())),
            sequence: AtomicU64::new(0),
            gui,
        }
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn add_client(&self, client: Arc<dyn EventClient>) {
        debug!("Registering event client {}", client.client_name());
        self.clients.write().push(client);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Payload cache of the most recently submitted event
    pub fn data_event(&self) -> Arc<DataEvent> {
        Arc::clone(&self.data_event.read())
    }

    /// Resets the shared data event from `event`, then dispatches it
    pub fn submit_event(&self, event: Event, mode: EventMode) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let data = Arc::new(DataEvent::from_event(sequence, &event));
        *self.data_event.write() = Arc::clone(&data);
        debug!("Submitting {}:{} event #{sequence} ({mode:?})", data.kind, data.type_name);

        match mode {
            EventMode::Foreground => {
                let clients = self.clients.read().clone();
                for status in deliver(&clients, &event, &data) {
                    self.publish(status);
                }
            }
            EventMode::Background => {
                let clients = self.clients.read().clone();
                for client in clients.into_iter().filter(|c| c.is_interesting(&event)) {
                    let event = event.clone();
                    let data = Arc::clone(&data);
                    let gui = self.gui.clone();
                    let label = format!("{}:{}", client.client_name(), data.type_name);
                    self.runner.spawn(label, move || {
                        if let Err(e) = client.process_event(&event, &data) {
                            error!("Client {} failed on {} event: {e}", client.client_name(), data.kind);
                            // Nobody listening on the Gui channel is not an error.
                            let _ = gui.send(Event::status(e.status_message()));
                        }
                    });
                }
            }
            EventMode::Gui => self.publish(event),
        }
    }

    /// Queues an event for the Gui pumps
    pub fn publish(&self, event: Event) {
        if self.gui.send(event).is_err() {
            debug!("No Gui subscriber, event dropped");
        }
    }

    pub fn subscribe_gui(&self) -> GuiPump {
        GuiPump {
            receiver: self.gui.subscribe(),
            clients: Arc::clone(&self.clients),
            sequence: 0,
        }
    }
}

/// Delivers to each interested client in order; returns status events for
/// the clients that failed.
fn deliver(clients: &[Arc<dyn EventClient>], event: &Event, data: &DataEvent) -> Vec<Event> {
    let mut statuses = Vec::new();
    for client in clients.iter().filter(|c| c.is_interesting(event)) {
        if let Err(e) = client.process_event(event, data) {
            error!("Client {} failed on {} event: {e}", client.client_name(), data.kind);
            statuses.push(Event::status(e.status_message()));
        }
    }
    statuses
}

/// Receiving end of the Gui channel, owned by the interface thread
pub struct GuiPump {
    receiver: broadcast::Receiver<Event>,
    clients: ClientList,
    sequence: u64,
}

impl GuiPump {
    /// Delivers every queued event to the registered clients and returns
    /// them for the caller's own rendering, followed by a status event for
    /// each client failure. Never blocks.
    pub fn pump(&mut self) -> Vec<Event> {
        let mut delivered = Vec::new();
        loop {
            let event = match self.receiver.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Gui pump lagged, {skipped} events dropped");
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            };
            self.sequence += 1;
            let data = DataEvent::from_event(self.sequence, &event);
            let clients = self.clients.read().clone();
            let statuses = deliver(&clients, &event, &data);
            delivered.push(event);
            delivered.extend(statuses);
        }
        delivered
    }
}
