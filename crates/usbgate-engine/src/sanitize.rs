// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sanitization of untrusted bytes before they reach logs, prompts or
//! error messages.

/// Replace every non-printable ASCII character with `_` and drop non-ASCII
/// bytes entirely.
pub(crate) fn sanitize_untrusted(untrusted: &[u8]) -> String {
    untrusted
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '_' })
        .collect()
}

/// Keep only printable ASCII and cap the length; used for excerpts of
/// remote error output.
pub(crate) fn printable_excerpt(untrusted: &[u8], max_len: usize) -> String {
    untrusted
        .iter()
        .filter(|b| (0x20..0x7f).contains(*b))
        .take(max_len)
        .map(|&b| b as char)
        .collect()
}
