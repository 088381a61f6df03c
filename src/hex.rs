// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error text and `Debug` output.
//!
//! Full payloads belong in a packet capture; an error message only needs
//! enough leading bytes to locate the problem, so each call site picks a
//! cap and anything beyond it is summarized as a count.

use pretty_hex::PrettyHex;

pub(crate) struct LimitedHex<'a> {
    data: &'a [u8],
    cap: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(data: &'a [u8], cap: usize) -> Self {
        Self { data, cap }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.data[..self.data.len().min(self.cap)];
        writeln!(f, "{} bytes:", self.data.len())?;
        write!(
            f,
            "{:#?}",
            shown.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if shown.len() < self.data.len() {
            let omitted = self.data.len() - shown.len();
            write!(f, "\n...{omitted} more bytes not shown...")?;
        }
        Ok(())
    }
}
