// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`]: one interleaved RTSP/RTP stream over TCP.
//!
//! The codec turns an arbitrarily-chunked inbound byte stream into discrete
//! units: interleaved data (`'$' | channel | u16-BE length | payload`) or
//! control responses (status line through `Content-Length`-sized body).
//! Anything not yet classifiable is retained for the next read; a unit whose
//! declared length never arrives stalls extraction, bounded only by the
//! session controller's response timeout.

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::{Host, Url};

use crate::rtsp::Response;
use crate::Error;

/// One demultiplexed inbound unit.
#[derive(Debug)]
pub(crate) enum ReceivedUnit {
    Response(Response),
    Data { channel: u8, data: Bytes },
}

/// An RTSP connection which implements `Stream` and a raw-bytes write path.
pub(crate) struct Connection(Framed<TcpStream, Codec>);

impl Connection {
    pub(crate) async fn connect(url: &Url) -> Result<Self, std::io::Error> {
        let host = url.host().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "URL has no host")
        })?;
        let port = url.port().unwrap_or(554);
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Ok(Self(Framed::new(stream, Codec)))
    }

    /// Writes raw, already-serialized request bytes.
    ///
    /// Failures are returned for the caller to report as a transport error;
    /// they never panic the loop.
    pub(crate) async fn send(&mut self, data: Bytes) -> Result<(), Error> {
        self.0.send(data).await.map_err(|e| match e {
            CodecError::Io(source) => Error::Write(source),
            CodecError::Parse { .. } => unreachable!("encoder is infallible"),
        })
    }
}

impl Stream for Connection {
    type Item = Result<ReceivedUnit, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| match e {
            CodecError::Io(source) => Error::Read(source),
            CodecError::Parse { description } => Error::RtspFraming { description },
        })
    }
}

/// Demultiplexes inbound bytes; encodes outbound requests verbatim.
pub(crate) struct Codec;

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`.
#[derive(Debug)]
pub(crate) enum CodecError {
    Io(std::io::Error),
    Parse { description: String },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

/// The fixed prefix that identifies a control response.
const STATUS_LINE_PREFIX: &[u8] = b"RTSP/1.0";

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedUnit;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() && src[0] == b'$' {
            if src.len() < 4 {
                return Ok(None);
            }
            let channel = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut unit = src.split_to(len);
            unit.advance(4);
            return Ok(Some(ReceivedUnit::Data {
                channel,
                data: unit.freeze(),
            }));
        }

        if src.len() >= STATUS_LINE_PREFIX.len() && src.starts_with(STATUS_LINE_PREFIX) {
            let header_end = match find_crlf_crlf(src) {
                Some(i) => i,
                None => return Ok(None),
            };
            let body_len = content_length(&src[..header_end]).map_err(|description| {
                CodecError::Parse {
                    description: format!(
                        "{description}; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128)
                    ),
                }
            })?;
            let total = header_end + 4 + body_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let unit = src.split_to(total).freeze();
            let response = Response::parse(unit).map_err(|description| CodecError::Parse {
                description,
            })?;
            return Ok(Some(ReceivedUnit::Response(response)));
        }

        // Any other prefix, or too few bytes to classify: retain everything
        // and wait for more.
        Ok(None)
    }
}

impl tokio_util::codec::Encoder<Bytes> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn find_crlf_crlf(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Finds a `Content-Length` header in the (complete) header block, returning
/// 0 if absent.
fn content_length(head: &[u8]) -> Result<usize, String> {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(value) = line.strip_prefix(b"Content-Length:") {
            return std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| "unparseable Content-Length".to_owned());
        }
    }
    Ok(0)
}
