// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP 1.0 client for IP cameras, using TCP-interleaved transport only.
//!
//! One [`client::RtspClient`] drives a session end to end: it negotiates
//! OPTIONS/DESCRIBE/SETUP/PLAY over a single TCP connection, demultiplexes
//! the interleaved stream of control responses and RTP packets coming back,
//! reassembles H.264, MJPEG, or MPEG-4 Part 2 frames, and hands each
//! completed frame to an application-supplied [`client::ClientDelegate`].
//! Keep-alive and reconnect policies run automatically once a session is
//! established.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

mod error;
mod hex;
pub mod rtp;

pub use error::Error;

pub mod client;
pub mod codec;
mod rtsp;
mod tokio;

pub use client::{ClientDelegate, ClientState, RtspClient};
pub use codec::CodecTag;
