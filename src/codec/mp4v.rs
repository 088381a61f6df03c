// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 Part 2 video, as described by
//! [RFC 3016](https://tools.ietf.org/html/rfc3016).
//!
//! The elementary stream needs no per-packet rewriting; the only work is
//! prepending the decoder configuration (VOS/VO/VOL headers) carried
//! hex-encoded in the SDP's `config=` attribute ahead of the first packet.

use crate::client::parse::SessionMedia;
use crate::rtp::RtpPacket;

use super::DepacketizeError;

pub(crate) fn depacketize(
    media: &SessionMedia,
    packet: &RtpPacket,
    is_first_payload: bool,
    frame: &mut Vec<u8>,
) -> Result<(), DepacketizeError> {
    if is_first_payload {
        let config = media
            .fmtp_param("config")
            .ok_or_else(|| parameter("no config".to_owned()))?;
        decode_hex(config, frame)?;
    }
    frame.extend_from_slice(packet.payload());
    Ok(())
}

fn parameter(description: String) -> DepacketizeError {
    DepacketizeError::Parameter {
        codec: "MP4V-ES",
        description,
    }
}

fn decode_hex(config: &str, frame: &mut Vec<u8>) -> Result<(), DepacketizeError> {
    if config.len() % 2 != 0 {
        return Err(parameter(format!("odd-length config {config:?}")));
    }
    for i in (0..config.len()).step_by(2) {
        let byte = u8::from_str_radix(&config[i..i + 2], 16)
            .map_err(|_| parameter(format!("non-hex config {config:?}")))?;
        frame.push(byte);
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
        SessionMedia::for_test(CodecTag::Mp4v, fmtp)
    }

    fn packet(payload: &[u8]) -> crate::rtp::RtpPacket {
        RtpPacketBuilder::default().build(payload).unwrap()
    }

    #[test]
    fn first_payload_prepends_config() {
        let media = media(Some("profile-level-id=1;config=000001B001"));
        let mut frame = Vec::new();
        depacketize(&media, &packet(&[0xaa, 0xbb]), true, &mut frame).unwrap();
        assert_eq!(frame, &[0x00, 0x00, 0x01, 0xb0, 0x01, 0xaa, 0xbb]);
    }

    #[test]
    fn later_payloads_pass_through() {
        let media = media(None);
        let mut frame = vec![0x01];
        depacketize(&media, &packet(&[0x02, 0x03]), false, &mut frame).unwrap();
        assert_eq!(frame, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn bad_config_fails() {
        let mut frame = Vec::new();
        let media = media(Some("config=xyz"));
        assert!(depacketize(&media, &packet(&[0]), true, &mut frame).is_err());
        let media = self::media(Some("profile-level-id=1"));
        assert!(depacketize(&media, &packet(&[0]), true, &mut frame).is_err());
    }
}
