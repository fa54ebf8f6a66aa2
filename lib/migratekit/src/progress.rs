// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Abstract progress reporting. The core emits events; rendering them
//! (terminal, log lines, anything else) is the caller's business.

/// Receives percentage progress for a long-running step.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, percent: u8, label: &str);
}

/// Discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _percent: u8, _label: &str) {}
}

/// Reports byte-granular copy progress as a percentage of `total`.
pub fn emit_bytes(
    sink: &dyn ProgressSink,
    label: &str,
    copied: u64,
    total: u64,
) {
    sink.emit(percent_of(copied, total), &format!("{label}: {copied}/{total} bytes"));
}

pub fn percent_of(part: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((part.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(0, 200), 0);
        assert_eq!(percent_of(50, 200), 25);
        assert_eq!(percent_of(200, 200), 100);
        assert_eq!(percent_of(500, 200), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
