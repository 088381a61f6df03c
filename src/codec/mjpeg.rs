// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP/JPEG video, as described by [RFC 2435](https://tools.ietf.org/html/rfc2435).
//!
//! The wire form strips the JPEG interchange headers; the first fragment of
//! each frame carries just enough (type, Q factor or inline quantization
//! tables, dimensions in 8-pixel blocks) to regenerate them. This module
//! synthesizes SOI/DQT/DRI/SOF0/DHT/SOS on the first fragment and appends
//! raw entropy-coded data from the rest.

use crate::rtp::RtpPacket;

use super::DepacketizeError;

const MAIN_HEADER_LEN: usize = 8;
const RESTART_MARKER_HEADER_LEN: usize = 4;
const QUANTIZATION_HEADER_LEN: usize = 4;

/// Types 64-127 are types 0-63 with restart markers; they carry an extra
/// header with the restart interval.
const RESTART_TYPE_MIN: u8 = 64;
const RESTART_TYPE_MAX: u8 = 127;

/// Table K.1 from the JPEG specification.
#[rustfmt::skip]
const LUMA_QUANTIZER: [u16; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61,
    12, 12, 14, 19, 26, 58, 60, 55,
    14, 13, 16, 24, 40, 57, 69, 56,
    14, 17, 22, 29, 51, 87, 80, 62,
    18, 22, 37, 56, 68, 109, 103, 77,
    24, 35, 55, 64, 81, 104, 113, 92,
    49, 64, 78, 87, 103, 121, 120, 101,
    72, 92, 95, 98, 112, 100, 103, 99,
];

/// Table K.2 from the JPEG specification.
#[rustfmt::skip]
const CHROMA_QUANTIZER: [u16; 64] = [
    17, 18, 24, 47, 99, 99, 99, 99,
    18, 21, 26, 66, 99, 99, 99, 99,
    24, 26, 56, 99, 99, 99, 99, 99,
    47, 66, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
];

const LUM_DC_CODELENS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const LUM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const LUM_AC_CODELENS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
#[rustfmt::skip]
const LUM_AC_SYMBOLS: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12,
    0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08,
    0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16,
    0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39,
    0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59,
    0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98,
    0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
    0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4,
    0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea,
    0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];
const CHM_DC_CODELENS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const CHM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const CHM_AC_CODELENS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
#[rustfmt::skip]
const CHM_AC_SYMBOLS: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21,
    0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91,
    0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34,
    0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58,
    0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78,
    0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
    0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2,
    0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9,
    0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

fn err(description: &'static str) -> DepacketizeError {
    DepacketizeError::Truncated {
        codec: "JPEG",
        description,
    }
}

pub(crate) fn depacketize(
    packet: &RtpPacket,
    frame: &mut Vec<u8>,
) -> Result<(), DepacketizeError> {
    let payload = packet.payload();
    if payload.len() < MAIN_HEADER_LEN {
        return Err(err("main header"));
    }
    let fragment_offset =
        u32::from_be_bytes([0, payload[1], payload[2], payload[3]]);
    let type_ = payload[4];
    let q = payload[5];
    let width_blocks = payload[6];
    let height_blocks = payload[7];

    // A fragment whose frame start was never assembled (e.g. joined
    // mid-frame, or the first fragment was dropped) can't contribute
    // anything decodable.
    if fragment_offset != 0 && frame.is_empty() {
        return Ok(());
    }

    let restart_header_len = if (RESTART_TYPE_MIN..=RESTART_TYPE_MAX).contains(&type_) {
        RESTART_MARKER_HEADER_LEN
    } else {
        0
    };

    if fragment_offset != 0 {
        let data_start = MAIN_HEADER_LEN + restart_header_len;
        if payload.len() < data_start {
            return Err(err("restart marker header"));
        }
        frame.extend_from_slice(&payload[data_start..]);
        return Ok(());
    }

    let mut offset = MAIN_HEADER_LEN;
    let mut dri = 0u16;
    if restart_header_len > 0 {
        if payload.len() < offset + restart_header_len {
            return Err(err("restart marker header"));
        }
        dri = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        offset += restart_header_len;
    }
    if payload.len() < offset + QUANTIZATION_HEADER_LEN {
        return Err(err("quantization table header"));
    }
    let q_len = usize::from(u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]));
    let tables_start = offset + QUANTIZATION_HEADER_LEN;
    let mut lqt = [0u8; 64];
    let mut cqt = [0u8; 64];
    if q_len > 0 {
        let per_table = q_len.min(64);
        if payload.len() < tables_start + q_len || payload.len() < tables_start + 2 * per_table {
            return Err(err("quantization table data"));
        }
        lqt[..per_table].copy_from_slice(&payload[tables_start..tables_start + per_table]);
        cqt[..per_table]
            .copy_from_slice(&payload[tables_start + per_table..tables_start + 2 * per_table]);
    } else {
        make_tables(q, &mut lqt, &mut cqt);
    }

    make_headers(frame, type_, width_blocks, height_blocks, &lqt, &cqt, dri);
    frame.extend_from_slice(&payload[tables_start + q_len..]);
    Ok(())
}

/// Derives quantization tables from the Q factor, per RFC 2435 appendix A.
fn make_tables(q: u8, lqt: &mut [u8; 64], cqt: &mut [u8; 64]) {
    let factor = u32::from(q.clamp(1, 99));
    let scale = if q < 50 { 5000 / factor } else { 200 - factor * 2 };
    for i in 0..64 {
        lqt[i] = ((u32::from(LUMA_QUANTIZER[i]) * scale + 50) / 100).clamp(1, 255) as u8;
        cqt[i] = ((u32::from(CHROMA_QUANTIZER[i]) * scale + 50) / 100).clamp(1, 255) as u8;
    }
}

fn push_quant_header(frame: &mut Vec<u8>, table: &[u8; 64], table_no: u8) {
    frame.extend_from_slice(&[0xff, 0xdb, 0, 67, table_no]);
    frame.extend_from_slice(table);
}

fn push_huffman_header(frame: &mut Vec<u8>, codelens: &[u8], symbols: &[u8], table_no: u8, table_class: u8) {
    frame.extend_from_slice(&[
        0xff,
        0xc4,
        0,
        (3 + codelens.len() + symbols.len()) as u8,
        (table_class << 4) | table_no,
    ]);
    frame.extend_from_slice(codelens);
    frame.extend_from_slice(symbols);
}

fn push_dri_header(frame: &mut Vec<u8>, dri: u16) {
    frame.extend_from_slice(&[0xff, 0xdd, 0, 4]);
    frame.extend_from_slice(&dri.to_be_bytes());
}

/// Regenerates the JPEG interchange headers the RTP form strips: SOI, two
/// DQTs, DRI (when restarts are in use), SOF0, four DHTs, SOS. The result
/// prefixes the entropy-coded scan data; no EOI is appended.
fn make_headers(
    frame: &mut Vec<u8>,
    type_: u8,
    width_blocks: u8,
    height_blocks: u8,
    lqt: &[u8; 64],
    cqt: &[u8; 64],
    dri: u16,
) {
    let width = u16::from(width_blocks) << 3;
    let height = u16::from(height_blocks) << 3;

    frame.extend_from_slice(&[0xff, 0xd8]); // SOI

    push_quant_header(frame, lqt, 0);
    push_quant_header(frame, cqt, 1);

    if dri != 0 {
        push_dri_header(frame, dri);
    }

    // SOF0: 8-bit precision, three components; luma subsampling 2x1 (types
    // 0/64) or 2x2 (types 1/65), chroma 1x1 against quantization table 1.
    let luma_sampling = if type_ & 0x3f == 0 { 0x21 } else { 0x22 };
    frame.extend_from_slice(&[0xff, 0xc0, 0, 17, 8]);
    frame.extend_from_slice(&height.to_be_bytes());
    frame.extend_from_slice(&width.to_be_bytes());
    frame.extend_from_slice(&[3, 0, luma_sampling, 0, 1, 0x11, 1, 2, 0x11, 1]);

    push_huffman_header(frame, &LUM_DC_CODELENS, &LUM_DC_SYMBOLS, 0, 0);
    push_huffman_header(frame, &LUM_AC_CODELENS, &LUM_AC_SYMBOLS, 0, 1);
    push_huffman_header(frame, &CHM_DC_CODELENS, &CHM_DC_SYMBOLS, 1, 0);
    push_huffman_header(frame, &CHM_AC_CODELENS, &CHM_AC_SYMBOLS, 1, 1);

    frame.extend_from_slice(&[0xff, 0xda, 0, 12, 3, 0, 0, 1, 0x11, 2, 0x11, 0, 63, 0]); // SOS
}
