// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::convert::TryFrom;
use std::ops::Range;

use bytes::Bytes;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// One decoded RTP packet, as extracted from an interleaved data unit.
///
/// Validates the raw buffer once on construction, then provides cheap
/// accessors for it. Never mutated after decode; the payload and header
/// extension are exposed as sub-slices of the original buffer.
pub struct RtpPacket {
    /// Full packet data, including headers.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    data: Bytes,

    /// Extension id and the range of the extension data within `data`.
    extension: Option<(u16, Range<u16>)>,

    payload_start: u16,
}

#[derive(Debug)]
pub struct PacketParseError {
    pub reason: &'static str,
    pub data: Bytes,
}

impl std::fmt::Display for PacketParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {:?}",
            self.reason,
            crate::hex::LimitedHex::new(&self.data, 64)
        )
    }
}

impl RtpPacket {
    /// Validates an RTP packet.
    ///
    /// Fails if the version is not 2 or any declared offset exceeds the
    /// buffer; such packets are dropped and logged by the caller.
    pub fn parse(data: Bytes) -> Result<Self, PacketParseError> {
        // RTP doesn't have a defined maximum size but it's implied by the
        // transport: interleaved data units carry at most 65,535 bytes.
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => {
                return Err(PacketParseError {
                    reason: "too long",
                    data,
                })
            }
        };
        if len < MIN_HEADER_LEN {
            return Err(PacketParseError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(PacketParseError {
                reason: "must be version 2",
                data,
            });
        }
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = data[0] & 0b0000_1111;
        let csrc_end = MIN_HEADER_LEN + (4 * u16::from(csrc_count));
        let mut extension = None;
        let payload_start = if has_extension {
            if len < csrc_end + 4 {
                return Err(PacketParseError {
                    reason: "extension is after end of packet",
                    data,
                });
            }
            let id = u16::from_be_bytes([
                data[usize::from(csrc_end)],
                data[usize::from(csrc_end) + 1],
            ]);
            let words = u16::from_be_bytes([
                data[usize::from(csrc_end) + 2],
                data[usize::from(csrc_end) + 3],
            ]);
            let ext_data_start = csrc_end + 4;
            let ext_data_end = match words.checked_mul(4).and_then(|l| ext_data_start.checked_add(l)) {
                Some(e) => e,
                None => {
                    return Err(PacketParseError {
                        reason: "extension extends beyond maximum packet size",
                        data,
                    })
                }
            };
            if len < ext_data_end {
                return Err(PacketParseError {
                    reason: "extension extends beyond end of packet",
                    data,
                });
            }
            extension = Some((id, ext_data_start..ext_data_end));
            ext_data_end
        } else {
            csrc_end
        };
        if len < payload_start {
            return Err(PacketParseError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        Ok(Self {
            data,
            extension,
            payload_start,
        })
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.data[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0b0111_1111
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Returns the header extension's id and raw data, if present.
    #[inline]
    pub fn extension(&self) -> Option<(u16, &[u8])> {
        self.extension
            .as_ref()
            .map(|(id, r)| (*id, &self.data[usize::from(r.start)..usize::from(r.end)]))
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[usize::from(self.payload_start)..]
    }

    /// Returns the raw packet, headers included.
    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("sequence_number", &self.sequence_number())
            .field("payload_type", &self.payload_type())
            .field("mark", &self.mark())
            .field("timestamp", &self.timestamp())
            .field("ssrc", &self.ssrc())
            .field("extension", &self.extension.as_ref().map(|(id, _)| id))
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

/// Testing API; allows constructing packets with arbitrary CSRC counts and
/// extensions without hand-assembling header bytes.
#[doc(hidden)]
pub struct RtpPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
    pub csrcs: Vec<u32>,
    pub extension: Option<(u16, Vec<u8>)>,
}

impl Default for RtpPacketBuilder {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            timestamp: 0,
            payload_type: 96,
            ssrc: 0,
            mark: false,
            csrcs: Vec::new(),
            extension: None,
        }
    }
}

impl RtpPacketBuilder {
    pub fn build(self, payload: &[u8]) -> Result<RtpPacket, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        if self.csrcs.len() > 15 {
            return Err("too many CSRCs");
        }
        if let Some((_, data)) = &self.extension {
            if data.len() % 4 != 0 {
                return Err("extension data must be a whole number of 32-bit words");
            }
        }
        let mut data = Vec::with_capacity(usize::from(MIN_HEADER_LEN) + payload.len());
        let extension_bit = if self.extension.is_some() { 0b0001_0000 } else { 0 };
        data.push((2 << 6) | extension_bit | self.csrcs.len() as u8);
        data.push(if self.mark { 0b1000_0000 } else { 0 } | self.payload_type);
        data.extend_from_slice(&self.sequence_number.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrcs {
            data.extend_from_slice(&csrc.to_be_bytes());
        }
        if let Some((id, ext)) = &self.extension {
            data.extend_from_slice(&id.to_be_bytes());
            data.extend_from_slice(&((ext.len() / 4) as u16).to_be_bytes());
            data.extend_from_slice(ext);
        }
        data.extend_from_slice(payload);
        if u16::try_from(data.len()).is_err() {
            return Err("payload too long");
        }
        RtpPacket::parse(Bytes::from(data)).map_err(|e| e.reason)
    }
}
