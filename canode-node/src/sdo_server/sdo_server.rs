use canode_common::{
    objects::{DataType, ObjectId, SubInfo},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
};
use crc16::CrcType as _;
use defmt_or_log::{debug, warn};

use crate::{
    config::NodeConfig,
    object_dict::{ODEntry, OdStream},
};

use super::{sdo_receiver::ReceiverState, SdoReceiver, SDO_BUFFER_SIZE};

fn validate_download_size(dl_size: usize, subobj: &SubInfo) -> Result<(), AbortCode> {
    if subobj.size == 0 {
        // Some objects (e.g. domains) do not provide a size, and we simply must write to them and
        // see if it fails. These objects report a size of 0.
        return Ok(());
    }
    if subobj.data_type.is_str() || matches!(subobj.data_type, DataType::Domain) {
        // Strings can write shorter lengths
        if dl_size > subobj.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    } else if dl_size < subobj.size {
        return Err(AbortCode::DataTypeMismatchLengthLow);
    } else if dl_size > subobj.size {
        return Err(AbortCode::DataTypeMismatchLengthHigh);
    }
    Ok(())
}

/// Read from the stream until `buf` is full or the value ends
fn read_fill(stream: &mut OdStream<'_>, buf: &mut [u8]) -> Result<usize, AbortCode> {
    let mut n = 0;
    while n < buf.len() {
        let count = stream.read(&mut buf[n..])?;
        if count == 0 {
            break;
        }
        n += count;
    }
    Ok(n)
}

fn check_total(received: usize, expected: Option<usize>) -> Result<(), AbortCode> {
    match expected {
        Some(size) if received > size => Err(AbortCode::DataTypeMismatchLengthHigh),
        Some(size) if received < size => Err(AbortCode::DataTypeMismatchLengthLow),
        _ => Ok(()),
    }
}

/// Settings latched from the [`NodeConfig`]
#[derive(Clone, Copy, Debug)]
struct ServerConfig {
    block_transfer: bool,
    buffer_size: usize,
    block_size: u8,
    timeout_us: u32,
}

/// What a transfer wants to happen after handling a cycle
enum Progress {
    /// Keep the transfer going, optionally sending a response
    Continue(Option<SdoResponse>),
    /// The transfer finished successfully
    Complete(Option<SdoResponse>),
    /// The client sent an abort
    ClientAbort,
}

trait Transfer {
    fn stream(&mut self) -> &mut OdStream<'static>;

    /// Whether completing this transfer changes the object
    fn is_download(&self) -> bool;
}

struct SegmentedDownload {
    stream: OdStream<'static>,
    toggle: bool,
    expected: Option<usize>,
    received: usize,
    buffered: usize,
}

struct SegmentedUpload {
    stream: OdStream<'static>,
    toggle: bool,
    size: usize,
    sent: usize,
    buffered: usize,
    buf_pos: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DownloadPhase {
    Receiving,
    /// The last block is held in the buffer until the end request says how much of it is valid
    AwaitEnd { held: usize },
}

struct BlockDownload {
    stream: OdStream<'static>,
    client_crc: bool,
    crc: u16,
    expected: Option<usize>,
    received: usize,
    blksize: u8,
    phase: DownloadPhase,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum UploadPhase {
    /// Waiting for the client to start the upload
    Initiated,
    /// Sending the segments of the current block
    Sending,
    /// Waiting for the client to confirm the block
    AwaitAck,
    /// Waiting for the client to confirm the end of the transfer
    AwaitEnd,
}

struct BlockUpload {
    stream: OdStream<'static>,
    client_crc: bool,
    crc: u16,
    size: usize,
    /// Bytes confirmed by the client
    acked: usize,
    blksize: u8,
    block_len: usize,
    segments: u8,
    next_seq: u8,
    phase: UploadPhase,
}

impl BlockUpload {
    fn is_last_block(&self) -> bool {
        self.acked + self.block_len >= self.size
    }
}

impl Transfer for SegmentedDownload {
    fn stream(&mut self) -> &mut OdStream<'static> {
        &mut self.stream
    }

    fn is_download(&self) -> bool {
        true
    }
}

impl Transfer for SegmentedUpload {
    fn stream(&mut self) -> &mut OdStream<'static> {
        &mut self.stream
    }

    fn is_download(&self) -> bool {
        false
    }
}

impl Transfer for BlockDownload {
    fn stream(&mut self) -> &mut OdStream<'static> {
        &mut self.stream
    }

    fn is_download(&self) -> bool {
        true
    }
}

impl Transfer for BlockUpload {
    fn stream(&mut self) -> &mut OdStream<'static> {
        &mut self.stream
    }

    fn is_download(&self) -> bool {
        false
    }
}

enum SdoState {
    Idle,
    DownloadSegmented(SegmentedDownload),
    UploadSegmented(SegmentedUpload),
    DownloadBlock(BlockDownload),
    UploadBlock(BlockUpload),
}

struct SdoResult {
    response: Option<SdoResponse>,
    updated_object: Option<ObjectId>,
    new_state: SdoState,
}

impl SdoResult {
    fn no_response(new_state: SdoState) -> Self {
        Self {
            response: None,
            updated_object: None,
            new_state,
        }
    }

    fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        warn!(
            "SDO abort 0x{:x} on {:x}sub{}",
            abort_code as u32, index, sub
        );
        Self {
            response: Some(SdoResponse::abort(index, sub, abort_code)),
            updated_object: None,
            new_state: SdoState::Idle,
        }
    }

    fn response(response: SdoResponse, new_state: SdoState) -> Self {
        Self {
            response: Some(response),
            updated_object: None,
            new_state,
        }
    }

    fn conclude<T: Transfer>(
        result: Result<Progress, AbortCode>,
        mut transfer: T,
        wrap: fn(T) -> SdoState,
    ) -> Self {
        match result {
            Ok(Progress::Continue(response)) => Self {
                response,
                updated_object: None,
                new_state: wrap(transfer),
            },
            Ok(Progress::Complete(response)) => {
                let stream = transfer.stream();
                let id = ObjectId::new(stream.index(), stream.sub());
                Self {
                    response,
                    updated_object: transfer.is_download().then_some(id),
                    new_state: SdoState::Idle,
                }
            }
            Ok(Progress::ClientAbort) => {
                let stream = transfer.stream();
                warn!(
                    "SDO transfer of {:x}sub{} aborted by client",
                    stream.index(),
                    stream.sub()
                );
                stream.cancel();
                Self::no_response(SdoState::Idle)
            }
            Err(abort_code) => {
                let stream = transfer.stream();
                stream.cancel();
                Self::abort(stream.index(), stream.sub(), abort_code)
            }
        }
    }
}

/// Implements an SDO server
///
/// A single SDO server can be controlled by a single SDO client (at one time). This struct wraps up
/// the state and implements handling of SDO requests. Received frames are collected by the
/// [`SdoReceiver`], and [`SdoServer::process`] advances the transfer once per cycle.
pub(crate) struct SdoServer {
    state: SdoState,
    config: ServerConfig,
}

impl SdoServer {
    /// Create an idle server with the default configuration
    pub const fn idle() -> Self {
        Self {
            state: SdoState::Idle,
            config: ServerConfig {
                block_transfer: true,
                buffer_size: SDO_BUFFER_SIZE,
                block_size: 127,
                timeout_us: NodeConfig::new().sdo_timeout_us,
            },
        }
    }

    /// Take the transfer limits from the node configuration
    pub fn configure(&mut self, config: &NodeConfig) {
        let buffer_size = config.effective_sdo_buffer_size();
        let block_size = config
            .effective_block_size()
            .min((buffer_size / 7).clamp(1, 127) as u8);
        self.config = ServerConfig {
            block_transfer: config.block_transfer,
            buffer_size,
            block_size,
            timeout_us: config.sdo_timeout_us,
        };
    }

    /// True when no transfer is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SdoState::Idle)
    }

    /// Drop any transfer in progress without notifying the client
    pub fn reset(&mut self, rx: &SdoReceiver) {
        match &mut self.state {
            SdoState::Idle => (),
            SdoState::DownloadSegmented(t) => t.stream.cancel(),
            SdoState::UploadSegmented(t) => t.stream.cancel(),
            SdoState::DownloadBlock(t) => t.stream.cancel(),
            SdoState::UploadBlock(t) => t.stream.cancel(),
        }
        self.state = SdoState::Idle;
        rx.reset();
    }

    /// Handle incoming SDO requests
    ///
    /// This will process the request, update server state and the object dictionary accordingly,
    /// and pass responses to `send`, which returns false when the frame could not be queued.
    /// Returns the updated object when a download is completed.
    pub fn process(
        &mut self,
        rx: &SdoReceiver,
        elapsed_us: u32,
        od: &'static [ODEntry<'static>],
        send: &mut dyn FnMut([u8; 8]) -> bool,
    ) -> Option<ObjectId> {
        let state = core::mem::replace(&mut self.state, SdoState::Idle);
        let result = match state {
            SdoState::Idle => self.handle_idle(rx, od),
            SdoState::DownloadSegmented(mut t) => {
                let progress = self.download_segment(&mut t, rx, elapsed_us);
                SdoResult::conclude(progress, t, SdoState::DownloadSegmented)
            }
            SdoState::UploadSegmented(mut t) => {
                let progress = self.upload_segment(&mut t, rx, elapsed_us);
                SdoResult::conclude(progress, t, SdoState::UploadSegmented)
            }
            SdoState::DownloadBlock(mut t) => {
                let progress = self.download_block(&mut t, rx, elapsed_us);
                SdoResult::conclude(progress, t, SdoState::DownloadBlock)
            }
            SdoState::UploadBlock(mut t) => {
                let progress = self.upload_block(&mut t, rx, elapsed_us, send);
                SdoResult::conclude(progress, t, SdoState::UploadBlock)
            }
        };

        if matches!(result.new_state, SdoState::Idle) && rx.state() != ReceiverState::Normal {
            rx.set_state(ReceiverState::Normal);
        }
        self.state = result.new_state;
        if let Some(response) = result.response {
            send(response.to_bytes());
        }
        if let Some(id) = result.updated_object {
            debug!("SDO download to {:x}sub{} complete", id.index, id.sub);
        }
        result.updated_object
    }

    fn next_request(
        &self,
        rx: &SdoReceiver,
        elapsed_us: u32,
    ) -> Result<Option<SdoRequest>, AbortCode> {
        match rx.take_request() {
            Some(req) => Ok(Some(req)),
            None => {
                if rx.increment_timer(elapsed_us) > self.config.timeout_us {
                    warn!("SDO timeout");
                    Err(AbortCode::SdoTimeout)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn handle_idle(&self, rx: &SdoReceiver, od: &'static [ODEntry<'static>]) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => return SdoResult::no_response(SdoState::Idle),
        };

        let (index, sub, result) = match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => (
                index,
                sub,
                self.initiate_download(od, index, sub, n, e, s, data),
            ),
            SdoRequest::InitiateUpload { index, sub } => {
                (index, sub, self.initiate_upload(rx, od, index, sub))
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => (
                index,
                sub,
                self.initiate_block_download(rx, od, index, sub, cc, s.then_some(size as usize)),
            ),
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => (
                index,
                sub,
                self.initiate_block_upload(rx, od, index, sub, cc, blksize, pst),
            ),
            // Nothing to abort
            SdoRequest::Abort { .. } => return SdoResult::no_response(SdoState::Idle),
            _ => (0, 0, Err(AbortCode::InvalidCommandSpecifier)),
        };
        result.unwrap_or_else(|abort_code| SdoResult::abort(index, sub, abort_code))
    }

    #[allow(clippy::too_many_arguments)]
    fn initiate_download(
        &self,
        od: &'static [ODEntry<'static>],
        index: u16,
        sub: u8,
        n: u8,
        e: bool,
        s: bool,
        data: [u8; 4],
    ) -> Result<SdoResult, AbortCode> {
        let mut stream = OdStream::open_index(od, index, sub)?;
        if !stream.info().access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }

        if e {
            let dl_size = if s {
                4 - n as usize
            } else {
                // Size not indicated: the whole object, up to the 4 bytes of an expedited frame
                match stream.info().size {
                    1..=4 => stream.info().size,
                    _ => 4,
                }
            };
            validate_download_size(dl_size, stream.info())?;
            stream.write(&data[..dl_size], true)?;
            Ok(SdoResult {
                response: Some(SdoResponse::download_acknowledge(index, sub)),
                updated_object: Some(ObjectId::new(index, sub)),
                new_state: SdoState::Idle,
            })
        } else {
            let expected = if s {
                let dl_size = u32::from_le_bytes(data) as usize;
                validate_download_size(dl_size, stream.info())?;
                Some(dl_size)
            } else {
                None
            };
            Ok(SdoResult::response(
                SdoResponse::download_acknowledge(index, sub),
                SdoState::DownloadSegmented(SegmentedDownload {
                    stream,
                    toggle: false,
                    expected,
                    received: 0,
                    buffered: 0,
                }),
            ))
        }
    }

    fn download_segment(
        &self,
        state: &mut SegmentedDownload,
        rx: &SdoReceiver,
        elapsed_us: u32,
    ) -> Result<Progress, AbortCode> {
        let Some(req) = self.next_request(rx, elapsed_us)? else {
            return Ok(Progress::Continue(None));
        };

        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != state.toggle {
                    return Err(AbortCode::ToggleNotAlternated);
                }
                let len = 7 - n as usize;
                state.received += len;
                if let Some(size) = state.expected {
                    if state.received > size {
                        return Err(AbortCode::DataTypeMismatchLengthHigh);
                    }
                }

                // SAFETY: The receiver is in the normal state during segmented transfers
                let buf = unsafe { &mut rx.buffer()[..self.config.buffer_size] };
                // Values larger than the buffer are passed on in pieces
                if state.buffered + len > buf.len() {
                    state.stream.write(&buf[..state.buffered], false)?;
                    state.buffered = 0;
                }
                buf[state.buffered..state.buffered + len].copy_from_slice(&data[..len]);
                state.buffered += len;

                let response = SdoResponse::download_segment_acknowledge(t);
                if c {
                    check_total(state.received, state.expected)?;
                    state.stream.write(&buf[..state.buffered], true)?;
                    Ok(Progress::Complete(Some(response)))
                } else {
                    state.toggle = !state.toggle;
                    Ok(Progress::Continue(Some(response)))
                }
            }
            SdoRequest::Abort { .. } => Ok(Progress::ClientAbort),
            _ => Err(AbortCode::InvalidCommandSpecifier),
        }
    }

    fn initiate_upload(
        &self,
        rx: &SdoReceiver,
        od: &'static [ODEntry<'static>],
        index: u16,
        sub: u8,
    ) -> Result<SdoResult, AbortCode> {
        let mut stream = OdStream::open_index(od, index, sub)?;
        let size = stream.read_size()?;

        if (1..=4).contains(&size) {
            let mut buf = [0; 4];
            let read = read_fill(&mut stream, &mut buf[..size])?;
            return Ok(SdoResult::response(
                SdoResponse::expedited_upload(index, sub, &buf[..read]),
                SdoState::Idle,
            ));
        }

        // Take the first buffer full now. Values which fit in the buffer are read atomically, and
        // larger values may be torn if they are written during the transfer.
        // SAFETY: The receiver is in the normal state outside block downloads
        let buf = unsafe { rx.buffer() };
        let cap = self.config.buffer_size - self.config.buffer_size % 7;
        let buffered = read_fill(&mut stream, &mut buf[..cap.min(size)])?;

        Ok(SdoResult::response(
            SdoResponse::upload_acknowledge(index, sub, size as u32),
            SdoState::UploadSegmented(SegmentedUpload {
                stream,
                toggle: false,
                size,
                sent: 0,
                buffered,
                buf_pos: 0,
            }),
        ))
    }

    fn upload_segment(
        &self,
        state: &mut SegmentedUpload,
        rx: &SdoReceiver,
        elapsed_us: u32,
    ) -> Result<Progress, AbortCode> {
        let Some(req) = self.next_request(rx, elapsed_us)? else {
            return Ok(Progress::Continue(None));
        };

        match req {
            SdoRequest::ReqUploadSegment { t } => {
                if t != state.toggle {
                    return Err(AbortCode::ToggleNotAlternated);
                }
                // SAFETY: The receiver is in the normal state during segmented transfers
                let buf = unsafe { rx.buffer() };
                if state.buf_pos == state.buffered && state.sent < state.size {
                    let cap = self.config.buffer_size - self.config.buffer_size % 7;
                    let remaining = state.size - state.sent;
                    state.buffered = read_fill(&mut state.stream, &mut buf[..cap.min(remaining)])?;
                    state.buf_pos = 0;
                    if state.buffered == 0 {
                        // The value got shorter than the size announced to the client
                        return Err(AbortCode::NoData);
                    }
                }

                let len = (state.buffered - state.buf_pos).min(7);
                let data = &buf[state.buf_pos..state.buf_pos + len];
                state.buf_pos += len;
                state.sent += len;
                let c = state.sent >= state.size;
                let response = SdoResponse::upload_segment(t, c, data);
                if c {
                    Ok(Progress::Complete(Some(response)))
                } else {
                    state.toggle = !state.toggle;
                    Ok(Progress::Continue(Some(response)))
                }
            }
            SdoRequest::Abort { .. } => Ok(Progress::ClientAbort),
            _ => Err(AbortCode::InvalidCommandSpecifier),
        }
    }

    fn initiate_block_download(
        &self,
        rx: &SdoReceiver,
        od: &'static [ODEntry<'static>],
        index: u16,
        sub: u8,
        client_crc: bool,
        expected: Option<usize>,
    ) -> Result<SdoResult, AbortCode> {
        if !self.config.block_transfer {
            return Err(AbortCode::InvalidCommandSpecifier);
        }
        let stream = OdStream::open_index(od, index, sub)?;
        if !stream.info().access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        if let Some(size) = expected {
            validate_download_size(size, stream.info())?;
        }

        let blksize = self.config.block_size;
        rx.begin_block(blksize);
        Ok(SdoResult::response(
            SdoResponse::block_download_acknowledge(true, index, sub, blksize),
            SdoState::DownloadBlock(BlockDownload {
                stream,
                client_crc,
                crc: crc16::XMODEM::init(),
                expected,
                received: 0,
                blksize,
                phase: DownloadPhase::Receiving,
            }),
        ))
    }

    fn download_block(
        &self,
        state: &mut BlockDownload,
        rx: &SdoReceiver,
        elapsed_us: u32,
    ) -> Result<Progress, AbortCode> {
        match state.phase {
            DownloadPhase::Receiving => self.receive_block(state, rx, elapsed_us),
            DownloadPhase::AwaitEnd { held } => {
                let Some(req) = self.next_request(rx, elapsed_us)? else {
                    return Ok(Progress::Continue(None));
                };
                match req {
                    SdoRequest::EndBlockDownload { n, crc } => {
                        let len = held.saturating_sub(n as usize);
                        // SAFETY: The receiver left the block state when the last block completed
                        let buf = unsafe { rx.buffer() };
                        let data = &buf[..len];
                        state.received += len;
                        check_total(state.received, state.expected)?;
                        let crc_calc = crc16::XMODEM::get(crc16::XMODEM::update(state.crc, data));
                        if state.client_crc && crc_calc != crc {
                            return Err(AbortCode::CrcError);
                        }
                        state.stream.write(data, true)?;
                        Ok(Progress::Complete(Some(SdoResponse::ConfirmBlockDownloadEnd)))
                    }
                    SdoRequest::Abort { .. } => Ok(Progress::ClientAbort),
                    _ => Err(AbortCode::InvalidCommandSpecifier),
                }
            }
        }
    }

    fn receive_block(
        &self,
        state: &mut BlockDownload,
        rx: &SdoReceiver,
        elapsed_us: u32,
    ) -> Result<Progress, AbortCode> {
        // During block download, up to 127 block segments are sent out in rapid succession, without
        // any acknowledgement, so the processing of these is handled in the receiver. Here, we wait
        // for the receiver to signal the completion of a block
        match rx.state() {
            // If receiver went back to normal state, that means it detected an Abort request
            ReceiverState::Normal | ReceiverState::UploadEnd => {
                rx.take_request();
                Ok(Progress::ClientAbort)
            }
            ReceiverState::BlockReceive => {
                if rx.increment_timer(elapsed_us) > self.config.timeout_us {
                    warn!("SDO block download timeout");
                    Err(AbortCode::SdoTimeout)
                } else {
                    Ok(Progress::Continue(None))
                }
            }
            ReceiverState::BlockCompleted { ackseq, complete } => {
                let len = ackseq as usize * 7;
                let response = SdoResponse::confirm_block(ackseq, state.blksize);
                if complete {
                    // This is the last block, but we can't do anything with it until we get the
                    // end block transfer request because we don't know how many bytes are
                    // invalid on the last segment
                    rx.set_state(ReceiverState::Normal);
                    state.phase = DownloadPhase::AwaitEnd { held: len };
                    return Ok(Progress::Continue(Some(response)));
                }

                // Segments after ackseq are resent by the client in the next block
                if len > 0 {
                    // SAFETY: The receiver does not write the buffer until the next block begins
                    let buf = unsafe { rx.buffer() };
                    let data = &buf[..len];
                    state.received += len;
                    if let Some(size) = state.expected {
                        if state.received > size {
                            return Err(AbortCode::DataTypeMismatchLengthHigh);
                        }
                    }
                    state.crc = crc16::XMODEM::update(state.crc, data);
                    state.stream.write(data, false)?;
                }
                rx.begin_block(state.blksize);
                Ok(Progress::Continue(Some(response)))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn initiate_block_upload(
        &self,
        rx: &SdoReceiver,
        od: &'static [ODEntry<'static>],
        index: u16,
        sub: u8,
        client_crc: bool,
        blksize: u8,
        pst: u8,
    ) -> Result<SdoResult, AbortCode> {
        if !self.config.block_transfer {
            return Err(AbortCode::InvalidCommandSpecifier);
        }
        if blksize == 0 || blksize > 127 {
            return Err(AbortCode::InvalidBlockSize);
        }
        let stream = OdStream::open_index(od, index, sub)?;
        let size = stream.read_size()?;
        if pst != 0 && size <= pst as usize {
            // Small enough to switch to a normal upload
            return self.initiate_upload(rx, od, index, sub);
        }

        Ok(SdoResult::response(
            SdoResponse::ConfirmBlockUpload {
                sc: true,
                s: true,
                index,
                sub,
                size: size as u32,
            },
            SdoState::UploadBlock(BlockUpload {
                stream,
                client_crc,
                crc: crc16::XMODEM::init(),
                size,
                acked: 0,
                blksize,
                block_len: 0,
                segments: 0,
                next_seq: 1,
                phase: UploadPhase::Initiated,
            }),
        ))
    }

    /// Read the next block, starting at the first byte not yet confirmed by the client
    fn load_block(&self, state: &mut BlockUpload, rx: &SdoReceiver) -> Result<(), AbortCode> {
        // SAFETY: The receiver is in the normal state during uploads
        let buf = unsafe { rx.buffer() };
        let cap = (state.blksize as usize * 7)
            .min(SDO_BUFFER_SIZE)
            .min(state.size - state.acked);
        state.stream.seek(state.acked);
        state.block_len = read_fill(&mut state.stream, &mut buf[..cap])?;
        if state.block_len < cap {
            return Err(AbortCode::NoData);
        }
        state.segments = state.block_len.div_ceil(7).max(1) as u8;
        state.next_seq = 1;
        state.phase = UploadPhase::Sending;
        Ok(())
    }

    fn send_segments(
        &self,
        state: &mut BlockUpload,
        rx: &SdoReceiver,
        send: &mut dyn FnMut([u8; 8]) -> bool,
    ) {
        // SAFETY: The receiver is in the normal state during uploads
        let buf = unsafe { rx.buffer() };
        let last_block = state.is_last_block();
        while state.next_seq <= state.segments {
            let start = (state.next_seq as usize - 1) * 7;
            let end = (start + 7).min(state.block_len);
            let c = last_block && state.next_seq == state.segments;
            let segment = BlockSegment::new(c, state.next_seq, &buf[start.min(end)..end]);
            if !send(segment.to_bytes()) {
                // Resume on the next cycle
                break;
            }
            state.next_seq += 1;
        }
        rx.reset_timer();
        if state.next_seq > state.segments {
            state.phase = UploadPhase::AwaitAck;
        }
    }

    fn upload_block(
        &self,
        state: &mut BlockUpload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        send: &mut dyn FnMut([u8; 8]) -> bool,
    ) -> Result<Progress, AbortCode> {
        if state.phase == UploadPhase::Sending {
            return match rx.take_request() {
                None => {
                    self.send_segments(state, rx, send);
                    Ok(Progress::Continue(None))
                }
                Some(SdoRequest::Abort { .. }) => Ok(Progress::ClientAbort),
                Some(_) => Err(AbortCode::InvalidCommandSpecifier),
            };
        }

        if state.phase == UploadPhase::AwaitEnd && rx.take_upload_ended() {
            return Ok(Progress::Complete(None));
        }

        let Some(req) = self.next_request(rx, elapsed_us)? else {
            return Ok(Progress::Continue(None));
        };
        match (state.phase, req) {
            (_, SdoRequest::Abort { .. }) => Ok(Progress::ClientAbort),
            (UploadPhase::Initiated, SdoRequest::StartBlockUpload) => {
                self.load_block(state, rx)?;
                self.send_segments(state, rx, send);
                Ok(Progress::Continue(None))
            }
            (UploadPhase::AwaitAck, SdoRequest::ConfirmBlock { ackseq, blksize }) => {
                if ackseq > state.segments {
                    return Err(AbortCode::InvalidSequenceNumber);
                }
                let finished = state.is_last_block() && ackseq == state.segments;
                let acked_len = (ackseq as usize * 7).min(state.block_len);
                // SAFETY: The receiver is in the normal state during uploads
                let buf = unsafe { rx.buffer() };
                state.crc = crc16::XMODEM::update(state.crc, &buf[..acked_len]);
                state.acked += acked_len;

                if finished {
                    let n = state.segments as usize * 7 - state.block_len;
                    let crc = if state.client_crc {
                        crc16::XMODEM::get(state.crc)
                    } else {
                        0
                    };
                    state.phase = UploadPhase::AwaitEnd;
                    rx.set_state(ReceiverState::UploadEnd);
                    return Ok(Progress::Continue(Some(SdoResponse::BlockUploadEnd {
                        n: n as u8,
                        crc,
                    })));
                }

                if blksize == 0 || blksize > 127 {
                    return Err(AbortCode::InvalidBlockSize);
                }
                state.blksize = blksize;
                self.load_block(state, rx)?;
                self.send_segments(state, rx, send);
                Ok(Progress::Continue(None))
            }
            (UploadPhase::AwaitEnd, SdoRequest::EndBlockUpload) => Ok(Progress::Complete(None)),
            _ => Err(AbortCode::InvalidCommandSpecifier),
        }
    }
}
