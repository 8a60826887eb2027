//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! HTTP/2 uses flow control to prevent senders from overwhelming receivers
//! with data. Flow control is applied at both the connection and stream level,
//! and every window in the engine is a [`FlowControlWindow`].

use crate::error::{Error, Result};
use std::fmt;

/// Largest legal window size (2^31 - 1)
const MAX_WINDOW: i64 = 0x7FFF_FFFF;

/// Smallest window reachable through SETTINGS changes (-2^31 + 1)
const MIN_WINDOW: i64 = -0x7FFF_FFFF;

/// Flow control window
///
/// A signed counter of bytes a sender may transmit before it is replenished.
/// The window may go negative after a SETTINGS_INITIAL_WINDOW_SIZE shrink but
/// never exceeds 2^31-1. Failed operations leave the window unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlWindow {
    window_size: i32,
}

impl FlowControlWindow {
    /// Create a window with the given initial size
    pub fn new(initial_size: u32) -> Self {
        // Initial sizes come from validated SETTINGS, which cap them at 2^31-1.
        FlowControlWindow {
            window_size: initial_size.min(MAX_WINDOW as u32) as i32,
        }
    }

    /// Current window size (may be negative)
    pub fn size(&self) -> i32 {
        self.window_size
    }

    /// Apply a WINDOW_UPDATE increment
    pub fn window_update(&mut self, increment: u32) -> Result<()> {
        if increment == 0 {
            return Err(Error::InvalidWindowIncrementSize);
        }
        self.apply_delta(i64::from(increment))
    }

    /// Apply a signed delta from a SETTINGS_INITIAL_WINDOW_SIZE change
    pub fn initial_size_changed(&mut self, delta: i32) -> Result<()> {
        self.apply_delta(i64::from(delta))
    }

    /// Consume window capacity for flow-controlled bytes
    pub fn consume(&mut self, bytes: usize) -> Result<()> {
        let bytes = i64::try_from(bytes).map_err(|_| Error::FlowControlViolation)?;
        if i64::from(self.window_size) < bytes {
            return Err(Error::FlowControlViolation);
        }
        self.window_size -= bytes as i32;
        Ok(())
    }

    fn apply_delta(&mut self, delta: i64) -> Result<()> {
        let new_size = i64::from(self.window_size) + delta;
        if !(MIN_WINDOW..=MAX_WINDOW).contains(&new_size) {
            return Err(Error::InvalidFlowControlWindowSize {
                delta,
                current_window_size: self.window_size,
            });
        }
        self.window_size = new_size as i32;
        Ok(())
    }
}

impl fmt::Display for FlowControlWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.window_size)
    }
}

/// Decides when the receiving side should replenish a window
///
/// The manager tracks the window the peer sees, plus bytes that were received
/// but not yet handed to the application. Once the window drops to half of its
/// target or less, it proposes a WINDOW_UPDATE increment that restores the
/// target, minus whatever is still buffered.
#[derive(Debug, Clone)]
pub struct InboundWindowManager {
    target_window_size: i64,
    current_window_size: i64,
    buffered_bytes: i64,
    closed: bool,
}

impl InboundWindowManager {
    /// Create a manager whose window starts at its target size
    pub fn new(target_window_size: u32) -> Self {
        let target = i64::from(target_window_size).min(MAX_WINDOW);
        InboundWindowManager {
            target_window_size: target,
            current_window_size: target,
            buffered_bytes: 0,
            closed: false,
        }
    }

    /// Target window size
    pub fn target_window_size(&self) -> i64 {
        self.target_window_size
    }

    /// Record the window size reported by the state machine
    ///
    /// Returns the increment to send, if any.
    pub fn new_window_size(&mut self, window_size: i32) -> Option<u32> {
        self.current_window_size = i64::from(window_size);
        self.calculate_increment()
    }

    /// A flow-controlled frame was received and buffered
    pub fn buffered_frame_received(&mut self, size: usize) {
        self.buffered_bytes += size as i64;
    }

    /// A buffered frame was handed to the application
    ///
    /// Returns the increment to send, if any.
    pub fn buffered_frame_emitted(&mut self, size: usize) -> Option<u32> {
        self.buffered_bytes = (self.buffered_bytes - size as i64).max(0);
        self.calculate_increment()
    }

    /// Local SETTINGS_INITIAL_WINDOW_SIZE changed by `delta`
    pub fn initial_window_size_changed(&mut self, delta: i32) -> Option<u32> {
        self.target_window_size = (self.target_window_size + i64::from(delta)).clamp(0, MAX_WINDOW);
        self.current_window_size += i64::from(delta);
        self.calculate_increment()
    }

    /// Stop proposing updates (the stream or connection closed)
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn calculate_increment(&mut self) -> Option<u32> {
        if self.closed || self.current_window_size > self.target_window_size / 2 {
            return None;
        }

        let increment = self.target_window_size - self.current_window_size - self.buffered_bytes;
        if increment <= 0 {
            return None;
        }

        self.current_window_size += increment;
        Some(increment as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_INITIAL_WINDOW_SIZE;

    #[test]
    fn test_flow_control_window_basic() {
        let window = FlowControlWindow::new(DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(window.size(), 65535);
        assert_eq!(window.to_string(), "65535");
    }

    #[test]
    fn test_flow_control_window_consume() {
        let mut window = FlowControlWindow::new(100);
        window.consume(50).unwrap();
        assert_eq!(window.size(), 50);

        assert_eq!(window.consume(60), Err(Error::FlowControlViolation));
        assert_eq!(window.size(), 50);

        window.consume(50).unwrap();
        assert_eq!(window.size(), 0);
        window.consume(0).unwrap();
    }

    #[test]
    fn test_flow_control_window_update() {
        let mut window = FlowControlWindow::new(100);
        window.consume(50).unwrap();
        window.window_update(100).unwrap();
        assert_eq!(window.size(), 150);
    }

    #[test]
    fn test_zero_increment_rejected() {
        let mut window = FlowControlWindow::new(100);
        assert_eq!(window.window_update(0), Err(Error::InvalidWindowIncrementSize));
        assert_eq!(window.size(), 100);
    }

    #[test]
    fn test_flow_control_window_overflow() {
        let mut window = FlowControlWindow::new(0x7FFF_FFFF);
        let result = window.window_update(1);
        assert!(matches!(
            result,
            Err(Error::InvalidFlowControlWindowSize { delta: 1, current_window_size: 0x7FFF_FFFF })
        ));
        assert_eq!(window.size(), 0x7FFF_FFFF);

        let mut window = FlowControlWindow::new(10);
        assert!(window.window_update(0x7FFF_FFF6).is_err());
        window.window_update(0x7FFF_FFF5).unwrap();
        assert_eq!(window.size(), 0x7FFF_FFFF);
    }

    #[test]
    fn test_initial_size_changed_goes_negative() {
        let mut window = FlowControlWindow::new(65535);
        window.consume(1000).unwrap();
        window.initial_size_changed(-65535).unwrap();
        assert_eq!(window.size(), -1000);

        assert_eq!(window.consume(1), Err(Error::FlowControlViolation));

        // Negative windows may still grow by the full 31-bit range.
        window.window_update(0x7FFF_FFFF).unwrap();
        assert_eq!(window.size(), 0x7FFF_FFFF - 1000);
    }

    #[test]
    fn test_initial_size_changed_overflow() {
        let mut window = FlowControlWindow::new(0x7FFF_FFFE);
        assert!(window.initial_size_changed(2).is_err());
        assert_eq!(window.size(), 0x7FFF_FFFE);
    }

    #[test]
    fn test_window_manager_waits_for_half() {
        let mut manager = InboundWindowManager::new(100);
        assert_eq!(manager.new_window_size(60), None);
        assert_eq!(manager.new_window_size(50), Some(50));
    }

    #[test]
    fn test_window_manager_accounts_for_buffered_bytes() {
        let mut manager = InboundWindowManager::new(100);
        manager.buffered_frame_received(30);
        assert_eq!(manager.new_window_size(40), Some(30));

        // 70 bytes credited so far; releasing the buffer tops it back up.
        assert_eq!(manager.new_window_size(20), Some(50));
        assert_eq!(manager.buffered_frame_emitted(30), None);
    }

    #[test]
    fn test_window_manager_closed() {
        let mut manager = InboundWindowManager::new(100);
        manager.close();
        assert_eq!(manager.new_window_size(0), None);
    }

    #[test]
    fn test_window_manager_initial_size_change() {
        let mut manager = InboundWindowManager::new(100);
        assert_eq!(manager.initial_window_size_changed(100), None);
        assert_eq!(manager.target_window_size(), 200);
        assert_eq!(manager.new_window_size(100), Some(100));
    }
}
