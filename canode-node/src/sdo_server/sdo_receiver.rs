use core::cell::UnsafeCell;

use canode_common::{
    sdo::{BlockSegment, SdoRequest},
    AtomicCell,
};

use super::SDO_BUFFER_SIZE;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ReceiverState {
    Normal,
    BlockReceive,
    BlockCompleted { ackseq: u8, complete: bool },
    /// The last block of an upload was confirmed, and the end request is handled on receipt
    UploadEnd,
}

/// Data structure for communicating SDO data between receiving and processing threads
///
/// It includes a data buffer, as during block downloads, message data is written directly into
/// the buffer in the IRQ. Since no response message is required for block segments until they are
/// all received, they may come in faster than process is executed to handle them.
///
/// A timer is also reset to 0 on each message received, and this can be used in `process()` to
/// implement a timeout in case an expected message is never received.
pub(crate) struct SdoReceiver {
    request: AtomicCell<Option<SdoRequest>>,
    state: AtomicCell<ReceiverState>,
    buffer: UnsafeCell<[u8; SDO_BUFFER_SIZE]>,
    timer: AtomicCell<u32>,
    last_seqnum: AtomicCell<u8>,
    blksize: AtomicCell<u8>,
    upload_ended: AtomicCell<bool>,
}

// The buffer is only written by the receiving side while in BlockReceive, and only accessed by the
// processing side in the other states
unsafe impl Sync for SdoReceiver {}

impl SdoReceiver {
    pub const fn new() -> Self {
        Self {
            request: AtomicCell::new(None),
            state: AtomicCell::new(ReceiverState::Normal),
            buffer: UnsafeCell::new([0; SDO_BUFFER_SIZE]),
            timer: AtomicCell::new(0),
            last_seqnum: AtomicCell::new(0),
            blksize: AtomicCell::new(0),
            upload_ended: AtomicCell::new(false),
        }
    }

    /// Handle received request from client
    ///
    /// Returns true if the processing side has work to do.
    pub fn handle_req(&self, msg_data: &[u8]) -> bool {
        // SDO frames always have 8 bytes
        if msg_data.len() != 8 {
            return false;
        }
        match self.state() {
            ReceiverState::Normal => self.store_request(msg_data),
            ReceiverState::UploadEnd => {
                if matches!(SdoRequest::try_from(msg_data), Ok(SdoRequest::EndBlockUpload)) {
                    // The client may start its next request before the server has seen this one
                    critical_section::with(|_| {
                        self.upload_ended.store(true);
                        self.timer.store(0);
                        self.set_state(ReceiverState::Normal);
                    });
                    true
                } else {
                    self.store_request(msg_data)
                }
            }
            ReceiverState::BlockReceive => {
                // An abort has 0x80 in the first byte, which would be seqnum 0 as a segment, and
                // seqnum 0 is never valid
                if self.take_abort(msg_data) {
                    return true;
                }
                let Ok(segment) = BlockSegment::try_from(msg_data) else {
                    return false;
                };
                if segment.seqnum == 0 {
                    return false;
                }

                critical_section::with(|_| {
                    self.timer.store(0);
                    let blksize = self.blksize.load();
                    let last = self.last_seqnum.load();
                    // Segments out of order are dropped, and the client resends everything after
                    // the last one received in order
                    let in_sequence = segment.seqnum == last + 1 && segment.seqnum <= blksize;
                    if in_sequence {
                        let pos = (segment.seqnum - 1) as usize * 7;
                        // SAFETY: The processing side does not touch the buffer in BlockReceive,
                        // and the critical section excludes other receiving contexts
                        let buffer = unsafe { &mut *self.buffer.get() };
                        if let Some(dest) = buffer.get_mut(pos..pos + 7) {
                            dest.copy_from_slice(&segment.data);
                        }
                        self.last_seqnum.store(segment.seqnum);
                    }

                    if segment.seqnum >= blksize || segment.c {
                        self.state.store(ReceiverState::BlockCompleted {
                            ackseq: self.last_seqnum.load(),
                            complete: segment.c && in_sequence,
                        });
                        true
                    } else {
                        false
                    }
                })
            }
            // Waiting for the block to be processed. Only an abort is accepted.
            ReceiverState::BlockCompleted { .. } => self.take_abort(msg_data),
        }
    }

    /// Store a request for the processing side
    ///
    /// A request which has not been processed yet is only replaced by an abort.
    fn store_request(&self, msg_data: &[u8]) -> bool {
        let Ok(req) = SdoRequest::try_from(msg_data) else {
            return false;
        };
        critical_section::with(|_| {
            let pending = self.request.load().is_some();
            if pending && !matches!(req, SdoRequest::Abort { .. }) {
                return false;
            }
            self.request.store(Some(req));
            self.timer.store(0);
            true
        })
    }

    fn take_abort(&self, msg_data: &[u8]) -> bool {
        if msg_data[0] != 0x80 {
            return false;
        }
        match SdoRequest::try_from(msg_data) {
            Ok(req @ SdoRequest::Abort { .. }) => {
                self.request.store(Some(req));
                self.set_state(ReceiverState::Normal);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_state(&self, state: ReceiverState) {
        self.state.store(state);
    }

    pub(crate) fn state(&self) -> ReceiverState {
        self.state.load()
    }

    pub(crate) fn take_request(&self) -> Option<SdoRequest> {
        self.request.take()
    }

    /// True once if the end of a block upload was received in the `UploadEnd` state
    pub(crate) fn take_upload_ended(&self) -> bool {
        self.upload_ended.take()
    }

    /// Access the transfer buffer from the processing side
    ///
    /// # Safety
    ///
    /// The receiver must not be in the `BlockReceive` state while the returned reference is alive,
    /// and only one reference may exist at a time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn buffer(&self) -> &mut [u8; SDO_BUFFER_SIZE] {
        &mut *self.buffer.get()
    }

    /// Start receiving a new block of segments, numbered from 1
    pub(crate) fn begin_block(&self, blksize: u8) {
        critical_section::with(|_| {
            self.last_seqnum.store(0);
            self.timer.store(0);
            self.blksize.store(blksize);
            self.set_state(ReceiverState::BlockReceive);
        });
    }

    pub(crate) fn reset_timer(&self) {
        self.timer.store(0);
    }

    pub(crate) fn increment_timer(&self, elapsed_us: u32) -> u32 {
        self.timer
            .fetch_update(|t| Some(t.saturating_add(elapsed_us)))
            .unwrap_or(0)
            .saturating_add(elapsed_us)
    }

    /// Drop any pending request and return to normal reception
    pub(crate) fn reset(&self) {
        critical_section::with(|_| {
            self.set_state(ReceiverState::Normal);
            self.request.store(None);
            self.upload_ended.store(false);
            self.timer.store(0);
        });
    }
}
