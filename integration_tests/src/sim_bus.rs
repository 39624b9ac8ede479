//! A simulated CAN bus connecting node mailboxes and test clients
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use canode_common::{
    messages::CanMessage,
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};
use canode_node::NodeMbox;
use crossbeam::channel::{unbounded, Receiver, RecvError, Sender, TryRecvError};

const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Default)]
struct BusInner {
    nodes: Vec<&'static NodeMbox>,
    listeners: Vec<Sender<CanMessage>>,
}

/// A bus delivering every frame to all attached node mailboxes and receivers
///
/// Frames are delivered synchronously from [`SimBusSender::send`], so a frame sent by a test is
/// stored in the node mailboxes before the send future completes.
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    pub fn new(nodes: Vec<&'static NodeMbox>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                nodes,
                listeners: Vec::new(),
            })),
        }
    }

    /// Create a sender for a device which is not one of the nodes, e.g. a test client
    pub fn new_sender(&mut self) -> SimBusSender {
        SimBusSender {
            inner: self.inner.clone(),
            origin: None,
        }
    }

    /// Create the sender for a node's outgoing frames
    ///
    /// A CAN controller does not receive its own frames, so they are not delivered back to
    /// `mbox`.
    pub fn node_sender(&mut self, mbox: &'static NodeMbox) -> SimBusSender {
        SimBusSender {
            inner: self.inner.clone(),
            origin: Some(mbox),
        }
    }

    /// Create a receiver which sees every frame sent on the bus from now on
    pub fn new_receiver(&mut self) -> SimBusReceiver {
        let (tx, rx) = unbounded();
        self.inner.lock().unwrap().listeners.push(tx);
        SimBusReceiver { rx }
    }
}

pub struct SimBusSender {
    inner: Arc<Mutex<BusInner>>,
    origin: Option<&'static NodeMbox>,
}

impl SimBusSender {
    /// Deliver a frame immediately
    pub fn send_now(&mut self, msg: CanMessage) {
        let inner = self.inner.lock().unwrap();
        for mbox in &inner.nodes {
            if self.origin.is_some_and(|origin| std::ptr::eq(origin, *mbox)) {
                continue;
            }
            // Frames which the node does not consume are dropped, as they would be by a filter
            mbox.store_message(msg).ok();
        }
        for listener in &inner.listeners {
            listener.send(msg).ok();
        }
    }
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.send_now(msg);
        Ok(())
    }
}

pub struct SimBusReceiver {
    rx: Receiver<CanMessage>,
}

impl SimBusReceiver {
    /// Drain all frames received so far
    pub fn drain(&mut self) -> Vec<CanMessage> {
        self.rx.try_iter().collect()
    }
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = RecvError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(RecvError),
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
