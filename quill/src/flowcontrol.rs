// Copyright (C) 2024, The quill Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

/// Receive-side flow control state, shared between the connection level
/// and individual streams.
///
/// The advertised limit lags behind consumption until less than half the
/// window remains, at which point a new grant (`MAX_DATA` or
/// `MAX_STREAM_DATA`) is due. Grants always extend the limit to
/// `consumed + window`, so the credit handed out stays constant while the
/// number of grant frames is kept low.
#[derive(Default, Debug)]
pub struct FlowControl {
    /// Bytes the application has read and released back to the peer.
    consumed: u64,

    /// The limit most recently advertised to the peer.
    max_data: u64,

    /// Size of the credit window granted on each update.
    window: u64,
}

impl FlowControl {
    pub fn new(max_data: u64, window: u64) -> Self {
        Self {
            max_data,
            window,
            ..Default::default()
        }
    }

    /// The limit the peer currently holds.
    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    /// Records bytes released back to the peer.
    pub fn add_consumed(&mut self, consumed: u64) {
        self.consumed += consumed;
    }

    /// Whether a new grant is due, i.e. the peer has burned through more
    /// than half of its window.
    pub fn should_update_max_data(&self) -> bool {
        self.max_data - self.consumed < self.window / 2
    }

    /// The limit the next grant would advertise.
    pub fn max_data_next(&self) -> u64 {
        self.consumed + self.window
    }

    /// Records that the next grant has been advertised.
    pub fn update_max_data(&mut self) {
        self.max_data = self.max_data_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_data() {
        let fc = FlowControl::new(100, 20);

        assert_eq!(fc.max_data(), 100);
    }

    #[test]
    fn update_max_data() {
        let mut fc = FlowControl::new(100, 20);

        // Consume most of the window, but not enough to trigger an update.
        fc.add_consumed(85);
        assert!(!fc.should_update_max_data());

        // Cross the half-window threshold.
        fc.add_consumed(10);
        assert!(fc.should_update_max_data());

        assert_eq!(fc.max_data_next(), 115);
        fc.update_max_data();
        assert_eq!(fc.max_data(), 115);
        assert!(!fc.should_update_max_data());
    }
}
