// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

use crate::config;

/// In-kernel timestamp representation.
///
/// This is measured in timer ticks since boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The next tick.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn as_millis(self) -> u64 {
        self.0 * u64::from(config::TICK_MS)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_scale_with_tick_length() {
        let t = Timestamp::default().next().next();
        assert_eq!(t.as_millis(), 2 * u64::from(config::TICK_MS));
    }
}
