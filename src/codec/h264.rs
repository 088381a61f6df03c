// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! as described by [RFC 6184](https://tools.ietf.org/html/rfc6184).
//!
//! Output is an Annex B byte stream: each forwarded NAL unit is preceded by a
//! start code. Single NAL units and fragmentation units (FU-A/FU-B) are the
//! packetization modes seen from fielded cameras; the aggregation types are
//! handled on a best-effort basis.

use base64::Engine as _;

use crate::client::parse::SessionMedia;
use crate::rtp::RtpPacket;

use super::DepacketizeError;

/// NAL types 7 (SPS) and 8 (PPS) also arrive out-of-band in the SDP
/// `sprop-parameter-sets` attribute; see [`prepend_parameter_sets`].
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;
const NAL_FU_B: u8 = 29;

fn err(description: &'static str) -> DepacketizeError {
    DepacketizeError::Truncated {
        codec: "H264",
        description,
    }
}

pub(crate) fn depacketize(
    media: &SessionMedia,
    packet: &RtpPacket,
    is_first_payload: bool,
    frame: &mut Vec<u8>,
) -> Result<(), DepacketizeError> {
    if is_first_payload {
        prepend_parameter_sets(media, frame)?;
    }

    let payload = packet.payload();
    if payload.is_empty() {
        return Err(err("empty payload"));
    }
    let nal_type = payload[0] & 0x1F;
    match nal_type {
        0 => frame.extend_from_slice(payload),
        NAL_SPS | NAL_PPS => {
            push_start_code(frame);
            frame.extend_from_slice(payload);
        }
        NAL_STAP_A => {
            // Only the first aggregated unit's bytes are forwarded; its
            // 2-byte size prefix is left in place. Cameras that aggregate
            // SPS/PPS this way still produce a decodable stream.
            push_start_code(frame);
            frame.extend_from_slice(&payload[1..]);
        }
        25..=27 => {
            if payload.len() < 3 {
                return Err(err("aggregation packet too short"));
            }
            push_start_code(frame);
            frame.extend_from_slice(&payload[3..]);
        }
        NAL_FU_A | NAL_FU_B => {
            if payload.len() < 2 {
                return Err(err("fragmentation unit too short"));
            }
            let start = (payload[1] >> 7) != 0;
            if start {
                // Reconstruct the original NAL header from the indicator's
                // F/NRI bits and the FU header's type bits.
                let header = (payload[0] & 0xE0) | (payload[1] & 0x1F);
                push_start_code(frame);
                frame.push(header);
                frame.extend_from_slice(&payload[2..]);
            } else {
                frame.extend_from_slice(&payload[2..]);
            }
        }
        _ => {
            push_start_code(frame);
            frame.extend_from_slice(payload);
        }
    }
    Ok(())
}

fn push_start_code(frame: &mut Vec<u8>) {
    frame.extend_from_slice(&[0x00, 0x00, 0x01]);
}

/// Decodes the SDP's `sprop-parameter-sets=<sps>,<pps>` attribute and
/// appends both NALs, each with a 4-byte start code, ahead of the stream's
/// first packet.
fn prepend_parameter_sets(
    media: &SessionMedia,
    frame: &mut Vec<u8>,
) -> Result<(), DepacketizeError> {
    let parameter = |description: String| DepacketizeError::Parameter {
        codec: "H264",
        description,
    };
    let sprop = media
        .fmtp_param("sprop-parameter-sets")
        .ok_or_else(|| parameter("no sprop-parameter-sets".to_owned()))?;
    let (sps, pps) = sprop
        .split_once(',')
        .ok_or_else(|| parameter(format!("sprop-parameter-sets {sprop:?} has no comma")))?;
    for nal in [sps, pps] {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(nal)
            .map_err(|e| parameter(format!("sprop-parameter-sets NAL {nal:?}: {e}")))?;
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        frame.extend_from_slice(&decoded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::client::parse::SessionMedia;
    use crate::codec::CodecTag;
    use crate::rtp::RtpPacketBuilder;

    use super::*;

    fn media(fmtp: Option<&str>) -> SessionMedia {
        SessionMedia::for_test(CodecTag::H264, fmtp)
    }

    fn packet(payload: &[u8]) -> crate::rtp::RtpPacket {
        RtpPacketBuilder::default().build(payload).unwrap()
    }

    #[test]
    fn single_nal_gets_start_code() {
        let media = media(None);
        let mut frame = Vec::new();
        // NAL type 5 (IDR slice).
        depacketize(&media, &packet(&[0x65, 0xaa, 0xbb]), false, &mut frame).unwrap();
        assert_eq!(frame, &[0x00, 0x00, 0x01, 0x65, 0xaa, 0xbb]);
    }

    #[test]
    fn sps_and_pps_get_start_codes() {
        let media = media(None);
        let mut frame = Vec::new();
        depacketize(&media, &packet(&[0x67, 0x64]), false, &mut frame).unwrap();
        depacketize(&media, &packet(&[0x68, 0xee]), false, &mut frame).unwrap();
        assert_eq!(frame, &[0, 0, 1, 0x67, 0x64, 0, 0, 1, 0x68, 0xee]);
    }

    #[test]
    fn fragmentation_unit_reassembly() {
        let media = media(None);
        let mut frame = Vec::new();
        // FU-A carrying NAL type 5 across three fragments. Indicator has
        // NRI 0b11; start fragment sets the S bit, the others clear it.
        depacketize(&media, &packet(&[0x7c, 0x85, 1, 2]), false, &mut frame).unwrap();
        depacketize(&media, &packet(&[0x7c, 0x05, 3, 4]), false, &mut frame).unwrap();
        depacketize(&media, &packet(&[0x7c, 0x45, 5, 6]), false, &mut frame).unwrap();
        assert_eq!(frame, &[0x00, 0x00, 0x01, 0x65, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn first_payload_prepends_parameter_sets() {
        // base64("\x67\x64\x00") = "Z2QA", base64("\x68\xee\x3c\x80") = "aO48gA=="
        let media = media(Some("packetization-mode=1;sprop-parameter-sets=Z2QA,aO48gA=="));
        let mut frame = Vec::new();
        depacketize(&media, &packet(&[0x65, 0x88]), true, &mut frame).unwrap();
        assert_eq!(
            frame,
            &[
                0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, // SPS
                0x00, 0x00, 0x00, 0x01, 0x68, 0xee, 0x3c, 0x80, // PPS
                0x00, 0x00, 0x01, 0x65, 0x88, // slice
            ]
        );
    }

    #[test]
    fn first_payload_without_sprop_fails() {
        let media = media(Some("packetization-mode=1"));
        let mut frame = Vec::new();
        let e = depacketize(&media, &packet(&[0x65]), true, &mut frame).unwrap_err();
        assert!(e.to_string().contains("sprop-parameter-sets"));
    }

    #[test]
    fn stap_a_forwards_first_unit_region() {
        let media = media(None);
        let mut frame = Vec::new();
        depacketize(&media, &packet(&[0x78, 0x00, 0x02, 0x67, 0x64]), false, &mut frame).unwrap();
        // Start code, then everything after the STAP-A indicator byte.
        assert_eq!(frame, &[0x00, 0x00, 0x01, 0x00, 0x02, 0x67, 0x64]);
    }

    #[test]
    fn truncated_fragmentation_unit_fails() {
        let media = media(None);
        let mut frame = Vec::new();
        assert!(depacketize(&media, &packet(&[0x7c]), false, &mut frame).is_err());
        assert!(frame.is_empty());
    }
}
