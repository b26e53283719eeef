//! Response dispatch
//!
//! Transactions subscribe to the (Call-ID, CSeq method) pairs they expect
//! answers on. The receive loop offers every inbound message here first;
//! whatever no subscription claims goes to the call router. Each message is
//! delivered to exactly one consumer.

use super::message::{SipError, SipMethod, SipMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Key a transaction is matched by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub call_id: String,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(call_id: &str, method: SipMethod) -> Self {
        Self {
            call_id: call_id.to_string(),
            method,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.call_id, self.method)
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<SipMessage>,
}

/// Subscriber registry consulted by the receive loop
#[derive(Debug, Clone, Default)]
pub struct ResponseDispatcher {
    subscriptions: Arc<RwLock<HashMap<TransactionKey, Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every key in `keys`. Fails if any key already has a subscriber.
    pub fn attach(&self, keys: Vec<TransactionKey>) -> Result<Subscription, SipError> {
        let mut subscriptions = self.subscriptions.write();
        if let Some(taken) = keys.iter().find(|k| subscriptions.contains_key(k)) {
            return Err(SipError::TransactionError(format!(
                "transaction {} already in progress",
                taken
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        for key in &keys {
            debug!("Attached transaction {}", key);
            subscriptions.insert(
                key.clone(),
                Subscriber {
                    id,
                    tx: tx.clone(),
                },
            );
        }

        Ok(Subscription {
            id,
            keys,
            rx,
            dispatcher: self.clone(),
        })
    }

    /// Remove the keys still owned by subscription `id`
    fn detach(&self, id: u64, keys: &[TransactionKey]) {
        let mut subscriptions = self.subscriptions.write();
        for key in keys {
            if subscriptions.get(key).is_some_and(|s| s.id == id) {
                subscriptions.remove(key);
                debug!("Detached transaction {}", key);
            }
        }
    }

    /// Hand `message` to its subscriber. Returns it back when nobody claims it.
    pub fn offer(&self, message: SipMessage) -> Option<SipMessage> {
        let Some(key) = message.transaction_key() else {
            return Some(message);
        };

        let subscriptions = self.subscriptions.read();
        match subscriptions.get(&key) {
            Some(subscriber) => match subscriber.tx.send(message) {
                Ok(()) => None,
                // Subscriber finished between lookup and send
                Err(mpsc::error::SendError(message)) => Some(message),
            },
            None => Some(message),
        }
    }

    pub fn is_attached(&self, key: &TransactionKey) -> bool {
        self.subscriptions.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

/// Messages routed to one transaction. Dropping it detaches its keys.
pub struct Subscription {
    id: u64,
    keys: Vec<TransactionKey>,
    rx: mpsc::UnboundedReceiver<SipMessage>,
    dispatcher: ResponseDispatcher,
}

impl Subscription {
    pub fn keys(&self) -> &[TransactionKey] {
        &self.keys
    }

    /// Next message, or `Timeout` once `deadline` passes
    pub async fn next_until(&mut self, deadline: Instant) -> Result<SipMessage, SipError> {
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(SipError::TransactionError("subscription closed".to_string())),
            Err(_) => Err(SipError::Timeout(
                self.keys
                    .first()
                    .map(|k| k.to_string())
                    .unwrap_or_default(),
            )),
        }
    }

    /// Detach and return anything that arrived but was never read
    pub fn close(mut self) -> Vec<SipMessage> {
        self.dispatcher.detach(self.id, &self.keys);
        self.rx.close();
        let mut leftovers = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            leftovers.push(message);
        }
        leftovers
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.detach(self.id, &self.keys);
    }
}
