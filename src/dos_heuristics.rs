//! Denial-of-service heuristics for inbound frames

use crate::error::{Error, Result};
use crate::frames::FramePayload;

/// Default number of consecutive empty DATA frames tolerated
pub const DEFAULT_MAX_SEQUENTIAL_EMPTY_DATA_FRAMES: usize = 1;

/// Detects floods of zero-length DATA frames
///
/// Empty DATA frames cost the receiver work but carry nothing, which makes them
/// a cheap way to burn CPU. The counter is reset by HEADERS and by END_STREAM;
/// going past the threshold is fatal to the connection (`ENHANCE_YOUR_CALM`).
#[derive(Debug, Clone)]
pub struct DosHeuristics {
    received_empty_data_frames: usize,
    max_sequential_empty_data_frames: usize,
}

impl DosHeuristics {
    pub fn new(max_sequential_empty_data_frames: usize) -> Self {
        DosHeuristics {
            received_empty_data_frames: 0,
            max_sequential_empty_data_frames,
        }
    }

    /// Account for one inbound frame
    pub fn process(&mut self, payload: &FramePayload) -> Result<()> {
        match payload {
            FramePayload::Data(data) => self.received_data(data.data.len(), data.end_stream),
            FramePayload::Headers(_) => {
                self.received_headers();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Account for a DATA frame carrying `length` body bytes
    pub fn received_data(&mut self, length: usize, end_stream: bool) -> Result<()> {
        if length == 0 {
            self.received_empty_data_frames += 1;
        }
        if end_stream {
            self.received_empty_data_frames = 0;
        }

        if self.received_empty_data_frames > self.max_sequential_empty_data_frames {
            return Err(Error::ExcessiveEmptyDataFrames);
        }
        Ok(())
    }

    pub fn received_headers(&mut self) {
        self.received_empty_data_frames = 0;
    }
}

impl Default for DosHeuristics {
    fn default() -> Self {
        DosHeuristics::new(DEFAULT_MAX_SEQUENTIAL_EMPTY_DATA_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{DataFrame, HeadersFrame};
    use crate::headers::Headers;
    use bytes::Bytes;

    fn empty_data(end_stream: bool) -> FramePayload {
        FramePayload::Data(DataFrame::new(Bytes::new(), end_stream))
    }

    #[test]
    fn test_second_empty_frame_trips() {
        let mut heuristics = DosHeuristics::default();
        heuristics.process(&empty_data(false)).unwrap();
        assert_eq!(
            heuristics.process(&empty_data(false)),
            Err(Error::ExcessiveEmptyDataFrames)
        );
    }

    #[test]
    fn test_non_empty_data_does_not_reset() {
        let mut heuristics = DosHeuristics::new(2);
        heuristics.process(&empty_data(false)).unwrap();
        heuristics
            .process(&FramePayload::Data(DataFrame::new(Bytes::from_static(b"x"), false)))
            .unwrap();
        heuristics.process(&empty_data(false)).unwrap();
        assert!(heuristics.process(&empty_data(false)).is_err());
    }

    #[test]
    fn test_headers_and_end_stream_reset() {
        let mut heuristics = DosHeuristics::default();
        heuristics.process(&empty_data(false)).unwrap();
        heuristics
            .process(&FramePayload::Headers(HeadersFrame::new(Headers::new(), false)))
            .unwrap();
        heuristics.process(&empty_data(false)).unwrap();
        heuristics.process(&empty_data(true)).unwrap();
        heuristics.process(&empty_data(false)).unwrap();
    }
}
