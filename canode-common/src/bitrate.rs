//! CAN bit rates supported by a node

/// One of the CiA 301 standard bit rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bitrate {
    /// 10 kbit/s
    Kbps10,
    /// 20 kbit/s
    Kbps20,
    /// 50 kbit/s
    Kbps50,
    /// 125 kbit/s
    #[default]
    Kbps125,
    /// 250 kbit/s
    Kbps250,
    /// 500 kbit/s
    Kbps500,
    /// 800 kbit/s
    Kbps800,
    /// 1 Mbit/s
    Kbps1000,
}

impl Bitrate {
    /// Create a bitrate from a value in kbit/s
    ///
    /// Returns None if the value is not one of the supported rates
    pub const fn from_kbps(kbps: u16) -> Option<Self> {
        match kbps {
            10 => Some(Self::Kbps10),
            20 => Some(Self::Kbps20),
            50 => Some(Self::Kbps50),
            125 => Some(Self::Kbps125),
            250 => Some(Self::Kbps250),
            500 => Some(Self::Kbps500),
            800 => Some(Self::Kbps800),
            1000 => Some(Self::Kbps1000),
            _ => None,
        }
    }

    /// Get the rate in kbit/s
    pub const fn kbps(&self) -> u16 {
        match self {
            Self::Kbps10 => 10,
            Self::Kbps20 => 20,
            Self::Kbps50 => 50,
            Self::Kbps125 => 125,
            Self::Kbps250 => 250,
            Self::Kbps500 => 500,
            Self::Kbps800 => 800,
            Self::Kbps1000 => 1000,
        }
    }
}
