use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{BalanceUpdatedEvent, ConnectionChangedEvent, EventHandler, EventProducer, Handler};

#[derive(Default, Clone)]
pub struct EventProducers {
    pub balance_updated_producer: Vec<EventProducer<BalanceUpdatedEvent>>,
    pub connection_changed_producer: Vec<EventProducer<ConnectionChangedEvent>>,
}

impl EventProducers {
    pub async fn publish_balance_updated(&self, event: BalanceUpdatedEvent) {
        for producer in &self.balance_updated_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_connection_changed(&self, event: ConnectionChangedEvent) {
        for producer in &self.connection_changed_producer {
            producer.publish_event(event.clone()).await;
        }
    }
}

pub struct EventHandlers {
    pub on_balance_updated: Option<EventHandler<BalanceUpdatedEvent>>,
    pub on_connection_changed: Option<EventHandler<ConnectionChangedEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_balance_updated = hooks.on_balance_updated.map(|f| EventHandler::new(buffer_size, f));
        let on_connection_changed = hooks.on_connection_changed.map(|f| EventHandler::new(buffer_size, f));
        Self { on_balance_updated, on_connection_changed }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_balance_updated {
            result.balance_updated_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_connection_changed {
            result.connection_changed_producer.push(handler.subscribe());
        }
        result
    }

    pub async fn start_handlers(self) {
        if let Some(handler) = self.on_balance_updated {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
        if let Some(handler) = self.on_connection_changed {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
    }
}

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_balance_updated: Option<Handler<BalanceUpdatedEvent>>,
    pub on_connection_changed: Option<Handler<ConnectionChangedEvent>>,
}

impl EventHooks {
    pub fn on_balance_updated<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(BalanceUpdatedEvent) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static {
        self.on_balance_updated = Some(Arc::new(f));
        self
    }

    pub fn on_connection_changed<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(ConnectionChangedEvent) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static {
        self.on_connection_changed = Some(Arc::new(f));
        self
    }
}
