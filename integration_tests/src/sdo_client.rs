//! A minimal SDO client for driving the node under test
use std::time::Duration;

use canode_common::{
    messages::{CanId, SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use crc16::{State, XMODEM};
use snafu::Snafu;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    #[snafu(display("No response from the server"))]
    NoResponse,
    #[snafu(display("Malformed response"))]
    MalformedResponse,
    #[snafu(display("Unexpected response {response:?}"))]
    UnexpectedResponse { response: SdoResponse },
    #[snafu(display("Server aborted with 0x{abort_code:08x}"))]
    ServerAbort { abort_code: u32 },
    #[snafu(display("Toggle bit not alternated"))]
    ToggleNotAlternated,
}

impl SdoClientError {
    /// The abort code, if the server aborted the transfer
    pub fn abort_code(&self) -> Option<AbortCode> {
        match self {
            SdoClientError::ServerAbort { abort_code } => AbortCode::try_from(*abort_code).ok(),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, SdoClientError>;

pub struct SdoClient<S, R> {
    req_cob_id: CanId,
    resp_cob_id: CanId,
    sender: S,
    receiver: R,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    pub fn new_std(server_node_id: u8, sender: S, receiver: R) -> Self {
        Self::new(
            CanId::Std(SDO_REQ_BASE + server_node_id as u16),
            CanId::Std(SDO_RESP_BASE + server_node_id as u16),
            sender,
            receiver,
        )
    }

    /// A client for a server channel with non default COB-IDs
    pub fn new(req_cob_id: CanId, resp_cob_id: CanId, sender: S, receiver: R) -> Self {
        Self {
            req_cob_id,
            resp_cob_id,
            sender,
            receiver,
        }
    }

    async fn send(&mut self, req: SdoRequest) {
        self.sender
            .send(req.to_can_message(self.req_cob_id))
            .await
            .expect("simulated bus rejected a frame");
    }

    /// Send a raw request, and return the server's answer
    pub async fn request(&mut self, req: SdoRequest) -> Result<SdoResponse> {
        self.send(req).await;
        self.wait_for_response().await
    }

    pub async fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        if data.len() <= 4 {
            let resp = self
                .request(SdoRequest::expedited_download(index, sub, data))
                .await?;
            return match resp {
                SdoResponse::ConfirmDownload { .. } => Ok(()),
                response => unexpected(response),
            };
        }

        let resp = self
            .request(SdoRequest::initiate_download(index, sub, Some(data.len() as u32)))
            .await?;
        match resp {
            SdoResponse::ConfirmDownload { .. } => (),
            response => return unexpected(response),
        }

        let mut toggle = false;
        let total_segments = data.len().div_ceil(7);
        for (n, chunk) in data.chunks(7).enumerate() {
            let last_segment = n == total_segments - 1;
            let resp = self
                .request(SdoRequest::download_segment(toggle, last_segment, chunk))
                .await?;
            match resp {
                SdoResponse::ConfirmDownloadSegment { t } if t == toggle => (),
                SdoResponse::ConfirmDownloadSegment { .. } => {
                    self.send(SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated))
                        .await;
                    return ToggleNotAlternatedSnafu.fail();
                }
                response => return unexpected(response),
            }
            toggle = !toggle;
        }
        Ok(())
    }

    pub async fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let mut read_buf = Vec::new();
        let resp = self.request(SdoRequest::initiate_upload(index, sub)).await?;
        let expedited = match resp {
            SdoResponse::ConfirmUpload { n, e, s, data, .. } => {
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    read_buf.extend_from_slice(&data[0..len]);
                }
                e
            }
            response => return unexpected(response),
        };

        if !expedited {
            let mut toggle = false;
            loop {
                let resp = self
                    .request(SdoRequest::upload_segment_request(toggle))
                    .await?;
                match resp {
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            self.send(SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated))
                                .await;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                        read_buf.extend_from_slice(&data[0..7 - n as usize]);
                        if c {
                            break;
                        }
                    }
                    response => return unexpected(response),
                }
                toggle = !toggle;
            }
        }
        Ok(read_buf)
    }

    /// Download with the block protocol, with CRC
    pub async fn block_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let resp = self
            .request(SdoRequest::initiate_block_download(index, sub, true, data.len() as u32))
            .await?;
        let (mut blksize, crc_enabled) = match resp {
            SdoResponse::ConfirmBlockDownload { blksize, sc, .. } => (blksize, sc),
            response => return unexpected(response),
        };

        let segments: Vec<&[u8]> = data.chunks(7).collect();
        let mut next = 0;
        while next < segments.len() {
            let block_end = (next + blksize as usize).min(segments.len());
            for (seq, segment) in segments[next..block_end].iter().enumerate() {
                let last = next + seq + 1 == segments.len();
                self.sender
                    .send(BlockSegment::new(last, seq as u8 + 1, segment).to_can_message(self.req_cob_id))
                    .await
                    .expect("simulated bus rejected a frame");
            }
            match self.wait_for_response().await? {
                SdoResponse::ConfirmBlock {
                    ackseq,
                    blksize: new_blksize,
                } => {
                    // Continue after the last segment the server acknowledged
                    next += ackseq as usize;
                    blksize = new_blksize;
                }
                response => return unexpected(response),
            }
        }

        let unused = (7 - data.len() % 7) % 7;
        let crc = if crc_enabled {
            State::<XMODEM>::calculate(data)
        } else {
            0
        };
        match self
            .request(SdoRequest::end_block_download(unused as u8, crc))
            .await?
        {
            SdoResponse::ConfirmBlockDownloadEnd => Ok(()),
            response => unexpected(response),
        }
    }

    /// Upload with the block protocol, with CRC
    pub async fn block_upload(&mut self, index: u16, sub: u8, blksize: u8) -> Result<Vec<u8>> {
        let resp = self
            .request(SdoRequest::initiate_block_upload(index, sub, true, blksize, 0))
            .await?;
        let crc_enabled = match resp {
            SdoResponse::ConfirmBlockUpload { sc, .. } => sc,
            response => return unexpected(response),
        };

        self.send(SdoRequest::StartBlockUpload).await;
        let mut data = Vec::new();
        loop {
            let mut ackseq = 0;
            let mut complete = false;
            while ackseq < blksize {
                let msg = self.wait_for_frame().await?;
                let segment =
                    BlockSegment::try_from(msg.data()).map_err(|_| MalformedResponseSnafu.build())?;
                if segment.seqnum != ackseq + 1 {
                    break;
                }
                ackseq = segment.seqnum;
                data.extend_from_slice(&segment.data);
                if segment.c {
                    complete = true;
                    break;
                }
            }
            if complete {
                let resp = self
                    .request(SdoRequest::ConfirmBlock { ackseq, blksize })
                    .await?;
                let SdoResponse::BlockUploadEnd { n, crc } = resp else {
                    return unexpected(resp);
                };
                data.truncate(data.len() - n as usize);
                if crc_enabled && crc != State::<XMODEM>::calculate(&data) {
                    self.send(SdoRequest::abort(index, sub, AbortCode::CrcError))
                        .await;
                    return MalformedResponseSnafu.fail();
                }
                self.send(SdoRequest::EndBlockUpload).await;
                return Ok(data);
            }
            self.send(SdoRequest::ConfirmBlock { ackseq, blksize }).await;
        }
    }

    /// Wait for the next frame from the server
    pub async fn wait_for_frame(&mut self) -> Result<canode_common::CanMessage> {
        let resp_cob_id = self.resp_cob_id;
        let wait = async {
            loop {
                match self.receiver.recv().await {
                    Ok(msg) if msg.id() == resp_cob_id => return Ok(msg),
                    Ok(_) => continue,
                    Err(_) => return NoResponseSnafu.fail(),
                }
            }
        };
        tokio::time::timeout(RESPONSE_TIMEOUT, wait)
            .await
            .map_err(|_| NoResponseSnafu.build())?
    }

    async fn wait_for_response(&mut self) -> Result<SdoResponse> {
        let msg = self.wait_for_frame().await?;
        SdoResponse::try_from(msg).map_err(|_| MalformedResponseSnafu.build())
    }

    /// Drop frames received so far
    pub fn flush(&mut self) {
        self.receiver.flush().ok();
    }
}

fn unexpected<T>(response: SdoResponse) -> Result<T> {
    match response {
        SdoResponse::Abort { abort_code, .. } => ServerAbortSnafu { abort_code }.fail(),
        response => UnexpectedResponseSnafu { response }.fail(),
    }
}
