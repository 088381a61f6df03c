// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific depacketization: turning RTP payloads into frame bytes.
//!
//! Each codec module contributes one pure function that appends a packet's
//! contribution to the frame under assembly. The session controller owns the
//! frame buffer and decides when it is complete (on the RTP marker bit).

use thiserror::Error;

use crate::client::parse::SessionMedia;
use crate::rtp::RtpPacket;

pub mod h264;
pub mod mjpeg;
pub mod mp4v;

/// The media codecs this crate can reassemble.
///
/// Closed set; a session whose SDP resolves to anything else fails with
/// [`crate::Error::UnknownCodec`] rather than silently dropping packets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodecTag {
    H264,
    Mp4v,
    Mjpeg,
    Unknown,
}

impl CodecTag {
    /// Maps an `rtpmap` encoding name to a tag.
    pub fn from_encoding(name: &str) -> Self {
        match name {
            "H264" => CodecTag::H264,
            "MP4V-ES" => CodecTag::Mp4v,
            "JPEG" => CodecTag::Mjpeg,
            _ => CodecTag::Unknown,
        }
    }
}

impl std::fmt::Display for CodecTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CodecTag::H264 => "H264",
            CodecTag::Mp4v => "MP4V-ES",
            CodecTag::Mjpeg => "JPEG",
            CodecTag::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Error)]
pub enum DepacketizeError {
    #[error("truncated {codec} payload: {description}")]
    Truncated {
        codec: &'static str,
        description: &'static str,
    },

    /// A session parameter (fmtp attribute) is missing or malformed.
    #[error("bad {codec} session parameter: {description}")]
    Parameter {
        codec: &'static str,
        description: String,
    },
}

/// Appends one RTP packet's contribution to `frame`.
///
/// `is_first_payload` is true for the first media packet of the whole
/// session; the H.264 and MP4V paths prepend out-of-band configuration from
/// the session's fmtp line before it. MJPEG inspects the current frame length
/// to discard fragments whose start was never seen, so `frame` must be the
/// same buffer across a frame's packets.
pub(crate) fn depacketize(
    tag: CodecTag,
    media: &SessionMedia,
    packet: &RtpPacket,
    is_first_payload: bool,
    frame: &mut Vec<u8>,
) -> Result<(), DepacketizeError> {
    match tag {
        CodecTag::H264 => h264::depacketize(media, packet, is_first_payload, frame),
        CodecTag::Mp4v => mp4v::depacketize(media, packet, is_first_payload, frame),
        CodecTag::Mjpeg => mjpeg::depacketize(packet, frame),
        CodecTag::Unknown => unreachable!("sessions with unknown codecs are refused at setup"),
    }
}
