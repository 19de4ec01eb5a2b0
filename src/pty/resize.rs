//! Resize control messages from the host UI
//!
//! The host UI owns the visible terminal widget; when its geometry
//! changes it writes a fixed 8-byte little-endian record to a side
//! channel (file descriptor 3, distinct from stdin): 16-bit row count,
//! 16-bit column count, then two reserved zero 16-bit fields. The
//! layout matches struct winsize, so the record translates directly to
//! a TIOCSWINSZ on the PTY master.

use nix::pty::Winsize;
use std::os::fd::AsRawFd;

/// The side-channel file descriptor carrying resize records.
pub const RESIZE_FD: i32 = 3;

/// Wire size of one resize record.
pub const RESIZE_RECORD_LEN: usize = 8;

/// A decoded terminal geometry change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeMessage {
    pub rows: u16,
    pub cols: u16,
}

impl ResizeMessage {
    /// Decode one 8-byte record. Returns None for degenerate geometry
    /// (zero rows or columns) — those records are ignored, not applied.
    pub fn decode(buf: &[u8; RESIZE_RECORD_LEN]) -> Option<Self> {
        let rows = u16::from_le_bytes([buf[0], buf[1]]);
        let cols = u16::from_le_bytes([buf[2], buf[3]]);
        // buf[4..8] are the reserved pixel fields; producers write zeros
        if rows == 0 || cols == 0 {
            return None;
        }
        Some(Self { rows, cols })
    }

    /// Encode to the wire layout (reserved fields zeroed).
    pub fn encode(&self) -> [u8; RESIZE_RECORD_LEN] {
        let mut buf = [0u8; RESIZE_RECORD_LEN];
        buf[0..2].copy_from_slice(&self.rows.to_le_bytes());
        buf[2..4].copy_from_slice(&self.cols.to_le_bytes());
        buf
    }

    pub fn winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }

    /// Apply this geometry to a PTY master. Best-effort: resize failure
    /// is non-fatal, the child just keeps its old size.
    pub fn apply<Fd: AsRawFd>(&self, master: &Fd) {
        let ws = self.winsize();
        // SAFETY:
        // - master is a valid open PTY master fd for the caller's lifetime
        // - ws is a fully initialized Winsize
        // - TIOCSWINSZ is the correct ioctl request for setting terminal window size
        // - Return value intentionally ignored: best-effort, see above
        unsafe {
            libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as libc::c_ulong, &ws);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_little_endian_fields() {
        // rows=300 (0x012C), cols=80 (0x0050)
        let buf = [0x2C, 0x01, 0x50, 0x00, 0, 0, 0, 0];
        let msg = ResizeMessage::decode(&buf).unwrap();
        assert_eq!(msg.rows, 300);
        assert_eq!(msg.cols, 80);
    }

    #[test]
    fn encode_reserved_fields_are_zero() {
        let msg = ResizeMessage { rows: 24, cols: 80 };
        let buf = msg.encode();
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(buf.len(), RESIZE_RECORD_LEN);
    }

    #[test]
    fn round_trip() {
        let msg = ResizeMessage {
            rows: 51,
            cols: 204,
        };
        assert_eq!(ResizeMessage::decode(&msg.encode()), Some(msg));
    }

    #[test]
    fn zero_geometry_rejected() {
        assert_eq!(ResizeMessage::decode(&[0; 8]), None);
        let degenerate = ResizeMessage { rows: 0, cols: 80 }.encode();
        assert_eq!(ResizeMessage::decode(&degenerate), None);
    }

    #[test]
    fn winsize_carries_geometry() {
        let ws = ResizeMessage { rows: 40, cols: 120 }.winsize();
        assert_eq!(ws.ws_row, 40);
        assert_eq!(ws.ws_col, 120);
        assert_eq!(ws.ws_xpixel, 0);
        assert_eq!(ws.ws_ypixel, 0);
    }
}
