// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// All the ways a session can fail.
///
/// The focus is on detailed human-readable messages; most variants carry
/// enough context to find the offending bytes in a packet capture.
#[derive(Debug, Error)]
pub enum Error {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to RTSP server: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {0}")]
    Read(#[source] std::io::Error),

    #[error("Error writing to RTSP peer: {0}")]
    Write(#[source] std::io::Error),

    /// Unparseable control response or corrupt interleaved framing.
    #[error("RTSP framing error: {description}")]
    RtspFraming { description: String },

    /// A non-success status in response to an in-flight request.
    #[error("{status} response to {method} CSeq={cseq}")]
    RtspStatus {
        method: &'static str,
        cseq: u32,
        status: u16,
    },

    /// An undecodable RTP packet. Dropped and logged, never fatal.
    #[error("RTP packet error: {0}")]
    Packet(String),

    #[error("depacketization error: {0}")]
    Depacketize(#[from] crate::codec::DepacketizeError),

    /// The DESCRIBE handshake resolved a codec this crate cannot reassemble.
    #[error("no depacketizer for media type {0:?}")]
    UnknownCodec(String),

    #[error("Timeout")]
    Timeout,
}
