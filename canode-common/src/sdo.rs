//! SDO frame codec
//!
//! Both directions of every CiA 301 SDO service are encoded here: expedited and segmented
//! transfers, block download and block upload, and abort. Block transfer data segments carry no
//! command specifier and are represented separately by [`BlockSegment`].
use crate::messages::{CanId, CanMessage};

/// Specifies the possible server command specifier (SCS) values in SDO response packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// Upload segment
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Acknowledge an upload initiation
    Upload = 2,
    /// Acknowledge a download initiation
    Download = 3,
    /// Abort
    Abort = 4,
    /// Block download responses
    BlockDownload = 5,
    /// Block upload responses
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = AbortCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(AbortCode::InvalidCommandSpecifier),
        }
    }
}

/// SDO abort codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC Error (block mode only )
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// General internal incompatibility in the device
    DeviceIncompatibility = 0x0604_0047,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value
    MaxLessThanMin = 0x0609_0036,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored to the application because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored to the application because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl TryFrom<u32> for AbortCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use AbortCode::*;
        const ALL: [AbortCode; 31] = [
            ToggleNotAlternated,
            SdoTimeout,
            InvalidCommandSpecifier,
            InvalidBlockSize,
            InvalidSequenceNumber,
            CrcError,
            OutOfMemory,
            UnsupportedAccess,
            WriteOnly,
            ReadOnly,
            NoSuchObject,
            UnnallowedPdo,
            PdoTooLong,
            IncompatibleParameter,
            DeviceIncompatibility,
            HardwareError,
            DataTypeMismatch,
            DataTypeMismatchLengthHigh,
            DataTypeMismatchLengthLow,
            NoSuchSubIndex,
            InvalidValue,
            ValueTooHigh,
            ValueTooLow,
            MaxLessThanMin,
            ResourceNotAvailable,
            GeneralError,
            CantStore,
            CantStoreLocalControl,
            CantStoreDeviceState,
            NoObjectDict,
            NoData,
        ];
        ALL.iter()
            .copied()
            .find(|code| *code as u32 == value)
            .ok_or(value)
    }
}

/// Specifies the possible client command specifier (CCS) values in SDO request packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate a download
    InitiateDownload = 1,
    /// Initiate an upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort
    Abort = 4,
    /// Block upload requests
    BlockUpload = 5,
    /// Block download requests
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = AbortCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(AbortCode::InvalidCommandSpecifier),
        }
    }
}

/// A message sent from an SDO client to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Begin a download (expedited or segmented)
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited
        e: bool,
        /// size valid
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// data (value on expedited, size when e=0 and s=1)
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Begin a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, contains the number of bytes to be downloaded
        size: u32,
    },
    /// Finish a block download
    EndBlockDownload {
        /// Number of unused bytes in the last segment
        n: u8,
        /// CRC of all the downloaded data
        crc: u16,
    },
    /// Begin a block upload
    InitiateBlockUpload {
        /// Client CRC supported flag
        cc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
        /// Protocol switch threshold. If the object size is <= pst, the server may answer with a
        /// normal upload instead.
        pst: u8,
    },
    /// Start sending block upload data
    StartBlockUpload,
    /// Acknowledge a block of the block upload
    ConfirmBlock {
        /// Last sequence number received in order
        ackseq: u8,
        /// Number of segments in the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUpload,
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Raw abort code
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download message
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create a download segment message. At most 7 bytes of `segment_data` are used.
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let len = segment_data.len().min(7);
        let mut data = [0; 7];
        data[0..len].copy_from_slice(&segment_data[0..len]);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - len as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an expedited download message. At most 4 bytes of `data` are used.
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[0..len]);

        SdoRequest::InitiateDownload {
            n: (4 - len) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download message
    pub fn initiate_block_download(index: u16, sub: u8, crc_supported: bool, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: crc_supported,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download message
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload message
    pub fn initiate_block_upload(index: u16, sub: u8, crc_supported: bool, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc: crc_supported,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Serialize into an 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ClientCommand::BlockDownload as u8) << 5 | (cc as u8) << 2 | (s as u8) << 1;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = (ClientCommand::BlockDownload as u8) << 5 | (n & 7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | (cc as u8) << 2;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 3;
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 1;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Build a CAN message with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

fn index_sub(value: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([value[1], value[2]]), value[3])
}

fn tail4(value: &[u8]) -> [u8; 4] {
    [value[4], value[5], value[6], value[7]]
}

fn tail7(value: &[u8]) -> [u8; 7] {
    [
        value[1], value[2], value[3], value[4], value[5], value[6], value[7],
    ]
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5).try_into()?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & (1 << 0)) != 0;
                Ok(SdoRequest::DownloadSegment {
                    t,
                    n,
                    c,
                    data: tail7(value),
                })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let (index, sub) = index_sub(value);
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data: tail4(value),
                })
            }
            ClientCommand::InitiateUpload => {
                let (index, sub) = index_sub(value);
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let (index, sub) = index_sub(value);
                let abort_code = u32::from_le_bytes(tail4(value));
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::BlockUpload => match value[0] & 0x3 {
                0 => {
                    let (index, sub) = index_sub(value);
                    Ok(SdoRequest::InitiateBlockUpload {
                        cc: (value[0] & (1 << 2)) != 0,
                        index,
                        sub,
                        blksize: value[4],
                        pst: value[5],
                    })
                }
                1 => Ok(SdoRequest::EndBlockUpload),
                2 => Ok(SdoRequest::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Ok(SdoRequest::StartBlockUpload),
            },
            ClientCommand::BlockDownload => {
                if value[0] & 1 == 0 {
                    let (index, sub) = index_sub(value);
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc: (value[0] & (1 << 2)) != 0,
                        s: (value[0] & (1 << 1)) != 0,
                        index,
                        sub,
                        size: u32::from_le_bytes(tail4(value)),
                    })
                } else {
                    Ok(SdoRequest::EndBlockDownload {
                        n: (value[0] >> 2) & 0x7,
                        crc: u16::from_le_bytes([value[1], value[2]]),
                    })
                }
            }
        }
    }
}

/// A message sent from an SDO server to a client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Acknowledge an upload initiation
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Acknowledge a download initiation
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Acknowledge a download segment
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Acknowledge a block download initiation
    ConfirmBlockDownload {
        /// Server CRC supported flag
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
    },
    /// Acknowledge a block of a block download
    ConfirmBlock {
        /// Last sequence number received in order
        ackseq: u8,
        /// Number of segments in the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block download
    ConfirmBlockDownloadEnd,
    /// Acknowledge a block upload initiation
    ConfirmBlockUpload {
        /// Server CRC supported flag
        sc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Size of the data to be uploaded, if s=1
        size: u32,
    },
    /// End of a block upload
    BlockUploadEnd {
        /// Number of unused bytes in the last segment
        n: u8,
        /// CRC of all uploaded data
        crc: u16,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Raw abort code
        abort_code: u32,
    },
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let command: ServerCommand = (value[0] >> 5).try_into()?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 7;
                let c = (value[0] & (1 << 0)) != 0;
                Ok(SdoResponse::UploadSegment {
                    t,
                    n,
                    c,
                    data: tail7(value),
                })
            }
            ServerCommand::SegmentDownload => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let (index, sub) = index_sub(value);
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data: tail4(value),
                })
            }
            ServerCommand::Download => {
                let (index, sub) = index_sub(value);
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::Abort => {
                let (index, sub) = index_sub(value);
                let abort_code = u32::from_le_bytes(tail4(value));
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ServerCommand::BlockDownload => match value[0] & 0x3 {
                0 => {
                    let (index, sub) = index_sub(value);
                    Ok(SdoResponse::ConfirmBlockDownload {
                        sc: (value[0] & (1 << 2)) != 0,
                        index,
                        sub,
                        blksize: value[4],
                    })
                }
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Err(AbortCode::InvalidCommandSpecifier),
            },
            ServerCommand::BlockUpload => match value[0] & 0x1 {
                0 => {
                    let (index, sub) = index_sub(value);
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc: (value[0] & (1 << 2)) != 0,
                        s: (value[0] & (1 << 1)) != 0,
                        index,
                        sub,
                        size: u32::from_le_bytes(tail4(value)),
                    })
                }
                _ => Ok(SdoResponse::BlockUploadEnd {
                    n: (value[0] >> 2) & 0x7,
                    crc: u16::from_le_bytes([value[1], value[2]]),
                }),
            },
        }
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = AbortCode;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        SdoResponse::try_from(msg.data())
    }
}

impl SdoResponse {
    /// Create an expedited upload response. At most 4 bytes of `data` are used.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[0..len]);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: 4 - len as u8,
            data: msg_data,
        }
    }

    /// Create a segmented upload initiation response
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment. At most 7 bytes of `data` are used.
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let len = data.len().min(7);
        let n = (7 - len) as u8;
        let mut buf = [0; 7];
        buf[0..len].copy_from_slice(&data[0..len]);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a download initiation response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment response
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a block download initiation response
    pub fn block_download_acknowledge(sc: bool, index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc,
            index,
            sub,
            blksize,
        }
    }

    /// Create a block acknowledgement
    pub fn confirm_block(ackseq: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlock { ackseq, blksize }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        let abort_code = abort_code as u32;
        SdoResponse::Abort {
            index,
            sub,
            abort_code,
        }
    }

    /// Serialize into an 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = (ServerCommand::SegmentUpload as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | (sc as u8) << 2;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 1;
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ServerCommand::BlockUpload as u8) << 5 | (sc as u8) << 2 | (s as u8) << 1;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = (ServerCommand::BlockUpload as u8) << 5 | (n & 7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Build a CAN message with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

/// A data segment of a block transfer
///
/// Layout: `{c: 1 bit, seqnum: 7 bits, data: 7 bytes}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSegment {
    /// Set on the last segment of the transfer
    pub c: bool,
    /// Sequence number within the block, 1..=127
    pub seqnum: u8,
    /// Segment data
    pub data: [u8; 7],
}

impl BlockSegment {
    /// Create a segment. At most 7 bytes of `data` are used.
    pub fn new(c: bool, seqnum: u8, data: &[u8]) -> Self {
        let len = data.len().min(7);
        let mut buf = [0; 7];
        buf[0..len].copy_from_slice(&data[0..len]);
        Self {
            c,
            seqnum: seqnum & 0x7f,
            data: buf,
        }
    }

    /// Serialize into an 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];
        payload[0] = (self.c as u8) << 7 | (self.seqnum & 0x7f);
        payload[1..8].copy_from_slice(&self.data);
        payload
    }

    /// Build a CAN message with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        Ok(Self {
            c: value[0] & 0x80 != 0,
            seqnum: value[0] & 0x7f,
            data: tail7(value),
        })
    }
}
