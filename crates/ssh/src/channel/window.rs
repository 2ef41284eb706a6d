//! Channel flow control (RFC 4254 Section 5.2).
//!
//! Each channel has two windows. The *remote* window tracks how much the
//! peer will still accept from us; it shrinks as we send and grows with
//! the peer's WINDOW_ADJUST. The *local* window tracks how much we will
//! still accept; it shrinks as data arrives and is topped back up, by one
//! WINDOW_ADJUST at a time, once the consumer has read more than half of
//! it.

use fynx_platform::{FynxError, FynxResult};

/// One direction's flow-control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataWindow {
    initial: u32,
    available: u32,
    max_packet: u32,
    unacked: u32,
}

impl DataWindow {
    /// Creates a window of `initial` bytes with a per-message limit of
    /// `max_packet` bytes.
    pub fn new(initial: u32, max_packet: u32) -> Self {
        Self {
            initial,
            available: initial,
            max_packet,
            unacked: 0,
        }
    }

    /// Bytes that may still be transferred.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Size the window was created with.
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Largest data payload per message.
    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }

    /// Bytes consumed but not yet returned to the peer.
    pub fn unacknowledged(&self) -> u32 {
        self.unacked
    }

    /// Takes up to `wanted` bytes of the remote window for one message.
    ///
    /// Returns how many bytes may be sent now: the minimum of the window,
    /// the maximum packet size and `wanted`. Zero means wait for an adjust.
    pub fn reserve(&mut self, wanted: usize) -> usize {
        let n = wanted
            .min(self.available as usize)
            .min(self.max_packet as usize);
        self.available -= n as u32;
        n
    }

    /// Applies a WINDOW_ADJUST from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if the window would exceed 2^32 - 1.
    pub fn adjust(&mut self, bytes: u32) -> FynxResult<()> {
        self.available = self.available.checked_add(bytes).ok_or_else(|| {
            FynxError::Protocol(format!(
                "Window adjust of {} overflows window of {}",
                bytes, self.available
            ))
        })?;
        Ok(())
    }

    /// Accounts for `len` bytes of data arriving from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if the peer sent more than the window
    /// or a single message larger than the maximum packet size.
    pub fn receive(&mut self, len: usize) -> FynxResult<()> {
        if len > self.max_packet as usize {
            return Err(FynxError::Protocol(format!(
                "Channel data of {} bytes exceeds maximum packet size {}",
                len, self.max_packet
            )));
        }
        if len > self.available as usize {
            return Err(FynxError::Protocol(format!(
                "Channel data of {} bytes exceeds window of {}",
                len, self.available
            )));
        }
        self.available -= len as u32;
        Ok(())
    }

    /// Records that the consumer has read `len` received bytes.
    ///
    /// Returns the size of the WINDOW_ADJUST to send once more than half of
    /// the initial window is waiting to be returned. The window is never
    /// restored past its initial size.
    pub fn consume(&mut self, len: usize) -> Option<u32> {
        let room = self
            .initial
            .saturating_sub(self.available)
            .saturating_sub(self.unacked);
        self.unacked += (len as u32).min(room);
        if self.unacked <= self.initial / 2 {
            return None;
        }
        let bytes = self.unacked;
        self.available += bytes;
        self.unacked = 0;
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reserve_limited_by_packet_size() {
        let mut window = DataWindow::new(32768, 32768);
        assert_eq!(window.reserve(40000), 32768);
        assert_eq!(window.available(), 0);
        assert_eq!(window.reserve(7232), 0);

        window.adjust(32768).unwrap();
        assert_eq!(window.reserve(7232), 7232);
        assert_eq!(window.available(), 32768 - 7232);
    }

    #[test]
    fn test_single_adjust_after_half() {
        let mut window = DataWindow::new(32768, 32768);
        window.receive(20000).unwrap();
        assert_eq!(window.consume(20000), Some(20000));
        assert_eq!(window.available(), 32768);
        assert_eq!(window.unacknowledged(), 0);
    }

    #[test]
    fn test_small_reads_accumulate() {
        let mut window = DataWindow::new(1000, 1000);
        window.receive(1000).unwrap();
        assert_eq!(window.consume(300), None);
        assert_eq!(window.consume(200), None);
        assert_eq!(window.consume(1), Some(501));
        assert_eq!(window.available(), 501);
    }

    #[test]
    fn test_overrun_rejected() {
        let mut window = DataWindow::new(100, 100);
        window.receive(60).unwrap();
        assert!(matches!(window.receive(41), Err(FynxError::Protocol(_))));
        assert!(matches!(
            DataWindow::new(1000, 10).receive(11),
            Err(FynxError::Protocol(_))
        ));
    }

    #[test]
    fn test_adjust_overflow() {
        let mut window = DataWindow::new(u32::MAX - 1, 1024);
        assert!(matches!(window.adjust(2), Err(FynxError::Protocol(_))));
        assert_eq!(window.available(), u32::MAX - 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(u32),
        Consume(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..5000).prop_map(Op::Receive),
            (0u32..5000).prop_map(Op::Consume),
        ]
    }

    proptest! {
        #[test]
        fn prop_local_window_bounded(initial in 1u32..100_000, ops in prop::collection::vec(op(), 0..200)) {
            let mut window = DataWindow::new(initial, initial);
            let mut buffered: u64 = 0;

            for op in ops {
                match op {
                    Op::Receive(n) => {
                        let fits = n <= window.available();
                        prop_assert_eq!(window.receive(n as usize).is_ok(), fits);
                        if fits {
                            buffered += n as u64;
                        }
                    }
                    Op::Consume(n) => {
                        let n = (n as u64).min(buffered);
                        buffered -= n;
                        if let Some(adjust) = window.consume(n as usize) {
                            prop_assert!(adjust > initial / 2);
                        }
                    }
                }
                prop_assert!(window.available() <= initial);
                prop_assert!(window.available() as u64 + window.unacknowledged() as u64 + buffered <= initial as u64);
            }
        }
    }
}
