/**
 * peer/data_channel.rs
 *
 * Ordered, reliable message channels multiplexed on the peer link
 */

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::peer::link::{Frame, FrameType, Outbound, MAX_MESSAGE_SIZE};
use crate::queue::Queue;

/// A message received on or sent over a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Binary(Bytes),
    Text(String),
}

/// Send-buffer watermark crossings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBufferState {
    /// Buffered bytes rose above the high-water mark
    Overflow,
    /// Buffered bytes fell back to the low-water mark
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Opening,
    Open,
    Closed,
}

pub(crate) type ChannelTable = Mutex<HashMap<u16, Arc<ChannelInner>>>;

pub(crate) struct ChannelInner {
    label: String,
    id: u16,
    outbound: mpsc::UnboundedSender<Outbound>,
    data_from_peer: Queue<Data>,
    send_buffer_events: Queue<SendBufferState>,
    buffered: AtomicUsize,
    overflowing: AtomicBool,
    high_water: usize,
    low_water: usize,
    state: watch::Sender<ChannelState>,
    table: Weak<ChannelTable>,
}

impl ChannelInner {
    pub(crate) fn new(
        label: String,
        id: u16,
        outbound: mpsc::UnboundedSender<Outbound>,
        water_marks: (usize, usize),
        table: &Arc<ChannelTable>,
        state: ChannelState,
    ) -> Arc<Self> {
        let (high_water, low_water) = water_marks;
        Arc::new(Self {
            label,
            id,
            outbound,
            data_from_peer: Queue::new(),
            send_buffer_events: Queue::new(),
            buffered: AtomicUsize::new(0),
            overflowing: AtomicBool::new(false),
            high_water,
            low_water,
            state: watch::channel(state).0,
            table: Arc::downgrade(table),
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn mark_open(&self) {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Opening {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Move to `Closed` and leave the channel table; true on the first call
    pub(crate) fn mark_closed(&self) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == ChannelState::Closed {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });
        if first {
            if let Some(table) = self.table.upgrade() {
                table.lock().remove(&self.id);
            }
            debug!(label = %self.label, id = self.id, "data channel closed");
        }
        first
    }

    pub(crate) fn deliver(&self, data: Data) {
        if *self.state.borrow() != ChannelState::Closed {
            self.data_from_peer.push(data);
        }
    }

    /// Credit `len` bytes that reached the socket
    pub(crate) fn on_written(&self, len: usize) {
        let remaining = self.buffered.fetch_sub(len, Ordering::AcqRel).saturating_sub(len);
        if remaining <= self.low_water && self.overflowing.swap(false, Ordering::AcqRel) {
            self.send_buffer_events.push(SendBufferState::Drained);
        }
    }

    fn enqueue(self: &Arc<Self>, kind: FrameType, payload: Bytes) -> Result<()> {
        let len = payload.len();
        let buffered = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        let outbound = Outbound {
            frame: Frame::new(kind, self.id, payload),
            sent_from: Some(Arc::clone(self)),
        };
        if self.outbound.send(outbound).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(Error::ChannelClosed);
        }
        if buffered > self.high_water && !self.overflowing.swap(true, Ordering::AcqRel) {
            self.send_buffer_events.push(SendBufferState::Overflow);
        }
        Ok(())
    }
}

/// Handle to a data channel owned by a `PeerConnection`
///
/// Dropping a handle does not close the channel; call `close`.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.inner.label)
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl DataChannel {
    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Messages received from the peer, in order
    pub fn data_from_peer_queue(&self) -> &Queue<Data> {
        &self.inner.data_from_peer
    }

    /// Overflow / drained notifications for this channel's send buffer
    pub fn send_buffer_queue(&self) -> &Queue<SendBufferState> {
        &self.inner.send_buffer_events
    }

    /// Queue `data` for sending; binary messages above the frame limit are
    /// split, text messages must fit in one frame
    pub fn send(&self, data: Data) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        match data {
            Data::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    return Err(Error::protocol("text message exceeds frame size"));
                }
                self.inner.enqueue(FrameType::Text, Bytes::from(text))
            }
            Data::Binary(mut bytes) => {
                while bytes.len() > MAX_MESSAGE_SIZE {
                    let chunk = bytes.split_to(MAX_MESSAGE_SIZE);
                    self.inner.enqueue(FrameType::Binary, chunk)?;
                }
                self.inner.enqueue(FrameType::Binary, bytes)
            }
        }
    }

    /// Bytes queued but not yet written to the link
    pub fn buffered_amount(&self) -> usize {
        self.inner.buffered.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.borrow() == ChannelState::Open
    }

    /// Close the channel and tell the peer; idempotent
    pub fn close(&self) {
        if self.inner.mark_closed() {
            let close = Frame::control(FrameType::Close, self.inner.id);
            let _ = self.inner.outbound.send(Outbound::control(close));
        }
    }

    /// Resolves once the channel is closed, by either side
    pub fn on_close(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.inner.state.subscribe();
        async move {
            let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
        }
    }
}
