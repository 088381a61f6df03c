// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! DESCRIBE response parsing: SDP body into [`SessionMedia`].

use crate::codec::CodecTag;

/// One media section of a presentation description, as negotiated via
/// DESCRIBE. Immutable once parsed; replaced wholesale on each handshake.
#[derive(Clone, Debug)]
pub struct SessionMedia {
    codec: CodecTag,
    encoding_name: String,
    control: Option<String>,
    fmtp: Option<String>,
    frame_rate: Option<f32>,
    dimensions: Option<(u16, u16)>,
}

impl SessionMedia {
    pub fn codec(&self) -> CodecTag {
        self.codec
    }

    /// The `rtpmap` encoding name, e.g. `H264`.
    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    /// The media section's `control` attribute: either an absolute URL or a
    /// path fragment to be joined with the session URL.
    pub fn control(&self) -> Option<&str> {
        self.control.as_deref()
    }

    pub fn frame_rate(&self) -> Option<f32> {
        self.frame_rate
    }

    pub fn dimensions(&self) -> Option<(u16, u16)> {
        self.dimensions
    }

    /// Looks up one `key=value` parameter within the `fmtp` attribute.
    pub fn fmtp_param(&self, key: &str) -> Option<&str> {
        let fmtp = self.fmtp.as_deref()?;
        for param in fmtp.split(';') {
            if let Some((k, v)) = param.trim().split_once('=') {
                if k == key {
                    return Some(v);
                }
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn for_test(codec: CodecTag, fmtp: Option<&str>) -> Self {
        SessionMedia {
            codec,
            encoding_name: codec.to_string(),
            control: None,
            fmtp: fmtp.map(str::to_owned),
            frame_rate: None,
            dimensions: None,
        }
    }
}

/// Parses a DESCRIBE response body into its media sections, in SDP order.
///
/// On error, returns a string which is expected to be packed into an
/// [`crate::Error::RtspFraming`].
pub(crate) fn parse_describe(body: &[u8]) -> Result<Vec<SessionMedia>, String> {
    let sdp = sdp_types::Session::parse(body).map_err(|e| {
        format!(
            "unable to parse SDP: {e}\n\n{:#?}",
            crate::hex::LimitedHex::new(body, 512)
        )
    })?;

    let session_control = attribute_value(&sdp.attributes, "control").map(str::to_owned);

    let mut medias = Vec::with_capacity(sdp.medias.len());
    for (i, m) in sdp.medias.iter().enumerate() {
        medias.push(
            parse_media(m, session_control.as_deref())
                .map_err(|e| format!("unable to parse media section {i}: {e}"))?,
        );
    }
    Ok(medias)
}

fn attribute_value<'a>(attributes: &'a [sdp_types::Attribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.attribute == name)
        .and_then(|a| a.value.as_deref())
}

fn parse_media(
    m: &sdp_types::Media,
    session_control: Option<&str>,
) -> Result<SessionMedia, String> {
    // RFC 8866: the first format listed is the default for the session.
    let payload_type = m
        .fmt
        .split_ascii_whitespace()
        .next()
        .ok_or("media line has no format")?;

    let mut encoding_name = None;
    let mut fmtp = None;
    let mut control = None;
    let mut frame_rate = None;
    let mut dimensions = None;
    for a in &m.attributes {
        if a.attribute == "rtpmap" {
            // rtpmap-value = payload-type SP encoding-name "/" clock-rate
            //   [ "/" encoding-params ]
            let v = a.value.as_deref().ok_or("rtpmap attribute with no value")?;
            let (pt, v) = v.split_once(' ').ok_or("invalid rtpmap attribute")?;
            if pt == payload_type {
                encoding_name = Some(v.split('/').next().unwrap_or(v).to_owned());
            }
        } else if a.attribute == "fmtp" {
            // Similarly starts with payload-type SP.
            let v = a.value.as_deref().ok_or("fmtp attribute with no value")?;
            let (pt, v) = v.split_once(' ').ok_or("invalid fmtp attribute")?;
            if pt == payload_type {
                fmtp = Some(v.to_owned());
            }
        } else if a.attribute == "control" {
            control = a.value.as_deref().map(str::to_owned);
        } else if a.attribute == "framerate" {
            frame_rate = a.value.as_deref().and_then(|v| v.trim().parse().ok());
        } else if a.attribute == "x-dimensions" {
            // Nonstandard but common on IP cameras: `width,height`.
            dimensions = a.value.as_deref().and_then(|v| {
                let (w, h) = v.split_once(',')?;
                Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
            });
        }
    }

    let encoding_name =
        encoding_name.ok_or_else(|| format!("no rtpmap for payload type {payload_type}"))?;
    Ok(SessionMedia {
        codec: CodecTag::from_encoding(&encoding_name),
        encoding_name,
        control: control.or_else(|| session_control.map(str::to_owned)),
        fmtp,
        frame_rate,
        dimensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE_BODY: &[u8] = b"v=0\r\n\
        o=- 1 1 IN IP4 192.168.0.10\r\n\
        s=Session streamed with test server\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z2QA,aO48gA==\r\n\
        a=framerate:25\r\n\
        a=x-dimensions:1280,720\r\n\
        a=control:track1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/8000\r\n\
        a=control:track2\r\n";

    #[test]
    fn parses_video_section() {
        let medias = parse_describe(DESCRIBE_BODY).unwrap();
        assert_eq!(medias.len(), 2);
        let video = &medias[0];
        assert_eq!(video.codec(), CodecTag::H264);
        assert_eq!(video.encoding_name(), "H264");
        assert_eq!(video.control(), Some("track1"));
        assert_eq!(video.frame_rate(), Some(25.0));
        assert_eq!(video.dimensions(), Some((1280, 720)));
        assert_eq!(
            video.fmtp_param("sprop-parameter-sets"),
            Some("Z2QA,aO48gA==")
        );
        assert_eq!(video.fmtp_param("packetization-mode"), Some("1"));
        assert_eq!(video.fmtp_param("config"), None);
    }

    #[test]
    fn unrecognized_encoding_maps_to_unknown() {
        let medias = parse_describe(DESCRIBE_BODY).unwrap();
        assert_eq!(medias[1].codec(), CodecTag::Unknown);
    }

    #[test]
    fn media_without_own_control_inherits_session_control() {
        let body = b"v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=s\r\n\
            t=0 0\r\n\
            a=control:rtsp://host/stream\r\n\
            m=video 0 RTP/AVP 26\r\n\
            a=rtpmap:26 JPEG/90000\r\n";
        let medias = parse_describe(body).unwrap();
        assert_eq!(medias[0].codec(), CodecTag::Mjpeg);
        assert_eq!(medias[0].control(), Some("rtsp://host/stream"));
    }

    #[test]
    fn garbage_fails() {
        assert!(parse_describe(b"not sdp at all\xff").is_err());
    }
}
