//! Scriptable in-memory transport.
//!
//! A [`MockTransport`] is paired with a [`MockHandle`] that lets a test push
//! inbound fragments, script replies to specific writes, drop the link and
//! inspect what was written.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::serial::SerialOpener;
use super::{LinkSignal, Transport, TransportDescriptor};
use crate::errors::TransportError;

#[derive(Debug, Default)]
struct MockShared {
    writes: Vec<Vec<u8>>,
    replies: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
    reply_to_any: Option<Vec<Vec<u8>>>,
    fail_writes: bool,
    closes: usize,
}

fn lock(shared: &Mutex<MockShared>) -> std::sync::MutexGuard<'_, MockShared> {
    // A panicking test thread must not hide the state from the others.
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MockTransport {
    descriptor: TransportDescriptor,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    loopback: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Mutex<MockShared>>,
    link: LinkSignal,
    closed: bool,
}

#[derive(Clone)]
pub struct MockHandle {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Mutex<MockShared>>,
    link: LinkSignal,
}

impl MockTransport {
    pub fn pair(label: &str) -> (MockTransport, MockHandle) {
        Self::with_descriptor(TransportDescriptor::Mock {
            label: label.to_string(),
        })
    }

    pub fn with_descriptor(descriptor: TransportDescriptor) -> (MockTransport, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(MockShared::default()));
        let link = LinkSignal::new();
        let transport = MockTransport {
            descriptor,
            inbound: rx,
            loopback: tx.clone(),
            shared: shared.clone(),
            link: link.clone(),
            closed: false,
        };
        let handle = MockHandle {
            inbound: tx,
            shared,
            link,
        };
        (transport, handle)
    }
}

impl MockHandle {
    /// Queue an inbound fragment.
    pub fn push(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(bytes.into());
    }

    /// Answer an exact write with `reply`, delivered in `chunk`-sized fragments.
    pub fn reply_to(&self, request: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>, chunk: usize) {
        let chunks = split(reply.into(), chunk);
        lock(&self.shared).replies.push((request.into(), chunks));
    }

    /// Answer every write with `reply`.
    pub fn reply_to_any(&self, reply: impl Into<Vec<u8>>) {
        lock(&self.shared).reply_to_any = Some(vec![reply.into()]);
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.shared).fail_writes = fail;
    }

    /// Simulate a transport-reported drop.
    pub fn drop_link(&self) {
        self.link.mark_down();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).writes.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.shared).closes
    }
}

fn split(bytes: Vec<u8>, chunk: usize) -> Vec<Vec<u8>> {
    bytes.chunks(chunk.max(1)).map(<[u8]>::to_vec).collect()
}

#[async_trait]
impl Transport for MockTransport {
    fn descriptor(&self) -> TransportDescriptor {
        self.descriptor.clone()
    }

    fn is_alive(&self) -> bool {
        !self.closed && !self.link.is_down()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }
        let replies = {
            let mut shared = lock(&self.shared);
            if shared.fail_writes {
                return Err(TransportError::WriteFailed("scripted failure".into()));
            }
            shared.writes.push(bytes.to_vec());
            shared
                .replies
                .iter()
                .find(|(request, _)| request.as_slice() == bytes)
                .map(|(_, chunks)| chunks.clone())
                .or_else(|| shared.reply_to_any.clone())
        };
        for chunk in replies.unwrap_or_default() {
            let _ = self.loopback.send(chunk);
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(TransportError::Disconnected),
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.link.mark_down();
            lock(&self.shared).closes += 1;
        }
    }
}

/// [`SerialOpener`] that hands out mock transports and records every attempt.
#[derive(Clone, Default)]
pub struct MockSerialOpener {
    port: String,
    answering: Vec<u32>,
    failing: Vec<u32>,
    opens: Arc<Mutex<Vec<u32>>>,
    handles: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockSerialOpener {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            ..Self::default()
        }
    }

    /// Rates at which the simulated instrument answers the handshake.
    pub fn answering_at(mut self, bauds: &[u32]) -> Self {
        self.answering = bauds.to_vec();
        self
    }

    /// Rates at which opening the port fails outright.
    pub fn failing_at(mut self, bauds: &[u32]) -> Self {
        self.failing = bauds.to_vec();
        self
    }

    pub fn opens(&self) -> Vec<u32> {
        self.opens
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn handles(&self) -> Vec<MockHandle> {
        self.handles
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn closes(&self) -> usize {
        self.handles().iter().map(MockHandle::close_count).sum()
    }
}

#[async_trait]
impl SerialOpener for MockSerialOpener {
    fn port_name(&self) -> &str {
        &self.port
    }

    async fn open(&self, baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        if let Ok(mut opens) = self.opens.lock() {
            opens.push(baud);
        }
        if self.failing.contains(&baud) {
            return Err(TransportError::OpenFailed {
                target: format!("{}@{}", self.port, baud),
                reason: "port busy".into(),
            });
        }
        let (transport, handle) = MockTransport::with_descriptor(TransportDescriptor::Serial {
            port: self.port.clone(),
            baud,
        });
        if self.answering.contains(&baud) {
            handle.reply_to_any(b"V1.0".to_vec());
        }
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripted_reply_arrives_in_fragments() {
        let (mut transport, handle) = MockTransport::pair("t");
        handle.reply_to(b"S".to_vec(), vec![7u8; 10], 4);

        transport.write(b"S").await.unwrap();
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(transport.read(Duration::from_millis(10)).await.unwrap().len());
        }
        assert_eq!(got, vec![4, 4, 2]);
        assert!(transport
            .read(Duration::from_millis(10))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(handle.writes(), vec![b"S".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_marks_link_down() {
        let (mut transport, handle) = MockTransport::pair("t");
        let state = transport.link_state();
        transport.close().await;
        transport.close().await;
        assert_eq!(handle.close_count(), 1);
        assert!(*state.borrow());
        assert!(matches!(
            transport.write(b"S").await,
            Err(TransportError::Disconnected)
        ));
    }
}
