#![allow(dead_code)]

use skateway_simulator::{Connector, DeviceIdentity, Error, Link, Message, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Sent {
    pub device_id: String,
    pub payload: String,
    pub content_type: String,
    pub content_encoding: String,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct Journal {
    pub connects: Vec<String>,
    pub sent: Vec<Sent>,
    pub disconnects: Vec<String>,
}

impl Journal {
    pub fn sent_by(&self, device_id: &str) -> Vec<Sent> {
        self.sent
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn count(list: &[String], device_id: &str) -> usize {
        list.iter().filter(|d| *d == device_id).count()
    }
}

/// In-memory stand-in for the hub: records every connect, send and
/// disconnect, and can be told to fail specific devices.
#[derive(Default)]
pub struct MemoryConnector {
    pub journal: Arc<Mutex<Journal>>,
    send_delay: Duration,
    connect_delay: Duration,
    refuse: HashSet<String>,
    fail_on_send: HashMap<String, usize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Connects only complete after `delay`; pending attempts are not journaled.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn refusing(mut self, device_id: &str) -> Self {
        self.refuse.insert(device_id.to_string());
        self
    }

    /// Every link opened for `device_id` fails its `nth` send (1-based).
    pub fn failing_send(mut self, device_id: &str, nth: usize) -> Self {
        self.fail_on_send.insert(device_id.to_string(), nth);
        self
    }

    pub fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap()
    }
}

impl Connector for MemoryConnector {
    type Link = MemoryLink;

    async fn connect(&self, identity: &DeviceIdentity, _credential: &str) -> Result<MemoryLink> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.refuse.contains(&identity.device_id) {
            return Err(Error::Refused("NotAuthorized".to_string()));
        }
        self.journal
            .lock()
            .unwrap()
            .connects
            .push(identity.device_id.clone());

        Ok(MemoryLink {
            device_id: identity.device_id.clone(),
            journal: self.journal.clone(),
            send_delay: self.send_delay,
            fail_on_send: self.fail_on_send.get(&identity.device_id).copied(),
            attempts: 0,
        })
    }
}

pub struct MemoryLink {
    device_id: String,
    journal: Arc<Mutex<Journal>>,
    send_delay: Duration,
    fail_on_send: Option<usize>,
    attempts: usize,
}

impl Link for MemoryLink {
    async fn send(&mut self, message: &Message) -> Result<()> {
        self.attempts += 1;
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if self.fail_on_send == Some(self.attempts) {
            return Err(Error::Transport("connection reset by peer".to_string()));
        }

        self.journal.lock().unwrap().sent.push(Sent {
            device_id: self.device_id.clone(),
            payload: message.payload.clone(),
            content_type: message.content_type.to_string(),
            content_encoding: message.content_encoding.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn disconnect(self) {
        self.journal
            .lock()
            .unwrap()
            .disconnects
            .push(self.device_id.clone());
    }
}
