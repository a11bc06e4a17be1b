//! Frame decoder state machine
//!
//! Assembles 33-byte frames from the raw byte stream, validates the
//! header/footer sentinels and tracks sequence continuity. Frames lost in
//! transit are replaced by placeholders built from the last good frame so
//! consumers keep seeing one sample per sample period.
//!
//! The board has no start-of-frame marker besides the header byte, which also
//! occurs inside channel data. The decoder therefore locks on to the frame
//! boundary pair `FOOTER HEADER` (`0xC0 0xA0`): the footer of one frame
//! followed by the header of the next. While frames keep validating, each
//! footer doubles as the boundary for the next frame.

use bci_core::{
    FieldDecoding, GainVector, RawFrame, Sample, SampleOrigin, FOOTER, FRAME_LEN, FULL_QUALITY,
    HEADER,
};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Decoder position within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Scanning for a frame boundary
    SeekHeader,
    /// Boundary seen; the next byte must be the header
    SeekType,
    /// Next byte is the sequence number
    ReadSeq,
    /// Reading the 30 channel and aux bytes
    ReadPayload,
    /// Next byte must be the footer
    ReadFooter,
}

/// Output of feeding one byte to the decoder
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// Placeholders for frames lost before the one being read, oldest first
    GapFill(Vec<Sample>),
    /// A footer-validated frame
    Frame(Sample),
}

/// Running counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub frames: u64,
    pub gap_fills: u64,
    pub desyncs: u64,
    pub heartbeats: u64,
}

/// Frames lost between `last` and `current`, plus one.
///
/// A difference of 1 means no gap. A repeated sequence number is treated as
/// the largest possible gap (255) so a stuck or duplicated stream forces a
/// resync instead of being silently accepted.
pub fn seq_diff(current: u8, last: u8) -> u8 {
    match current.wrapping_sub(last) {
        0 => u8::MAX,
        diff => diff,
    }
}

const PAYLOAD_END: usize = FRAME_LEN - 1;

pub struct FrameDecoder {
    state: ReadState,
    frame: [u8; FRAME_LEN],
    cursor: usize,
    last: Option<RawFrame>,
    good_frames: u32,
    sync_threshold: u32,
    decoding: FieldDecoding,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(sync_threshold: u8, decoding: FieldDecoding) -> Self {
        FrameDecoder {
            state: ReadState::SeekHeader,
            frame: [0; FRAME_LEN],
            cursor: 0,
            last: None,
            good_frames: 0,
            sync_threshold: u32::from(sync_threshold),
            decoding,
            stats: DecoderStats::default(),
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// True once enough consecutive good frames were seen since the last resync
    pub fn is_synced(&self) -> bool {
        self.good_frames > self.sync_threshold
    }

    /// Feed one byte from the transport
    pub fn push(&mut self, byte: u8, gains: &GainVector) -> Option<DecodeEvent> {
        match self.state {
            ReadState::SeekHeader => {
                if byte == FOOTER {
                    self.state = ReadState::SeekType;
                }
                None
            }
            ReadState::SeekType => {
                if byte == HEADER {
                    self.frame[0] = byte;
                    self.state = ReadState::ReadSeq;
                } else if byte != FOOTER {
                    self.state = ReadState::SeekHeader;
                }
                None
            }
            ReadState::ReadSeq => {
                self.frame[1] = byte;
                self.cursor = 2;
                self.state = ReadState::ReadPayload;
                self.fill_gap(byte, gains).map(DecodeEvent::GapFill)
            }
            ReadState::ReadPayload => {
                self.frame[self.cursor] = byte;
                self.cursor += 1;
                if self.cursor == PAYLOAD_END {
                    self.state = ReadState::ReadFooter;
                }
                None
            }
            ReadState::ReadFooter => {
                if byte == FOOTER {
                    self.frame[PAYLOAD_END] = byte;
                    Some(DecodeEvent::Frame(self.finish_frame(gains)))
                } else {
                    if self.is_synced() {
                        warn!(byte, "Footer out of sync");
                    } else {
                        trace!(byte, "Footer mismatch while locking on");
                    }
                    self.stats.desyncs += 1;
                    self.good_frames = 0;
                    self.state = ReadState::SeekHeader;
                    None
                }
            }
        }
    }

    fn finish_frame(&mut self, gains: &GainVector) -> Sample {
        let frame = RawFrame::from_bytes(self.frame);
        let aligned = self.is_synced();
        self.good_frames = self.good_frames.saturating_add(1);
        self.last = Some(frame);
        self.stats.frames += 1;
        // The footer just read is the boundary of the next frame.
        self.state = ReadState::SeekType;
        frame.to_sample(gains, self.decoding, FULL_QUALITY, SampleOrigin::Decoded, aligned)
    }

    fn fill_gap(&mut self, sequence: u8, gains: &GainVector) -> Option<Vec<Sample>> {
        let mut last = self.last?;
        let mut diff = seq_diff(sequence, last.sequence());
        if diff <= 1 {
            return None;
        }

        if self.is_synced() {
            warn!(
                behind = diff,
                got = sequence,
                expected = last.sequence().wrapping_add(1),
                "Frames lost, filling gap"
            );
        } else {
            debug!(behind = diff, "Sequence gap while locking on");
        }

        let mut fills = Vec::with_capacity(usize::from(diff - 1));
        while diff > 1 {
            last = last.with_sequence(last.sequence().wrapping_add(1));
            let quality = FULL_QUALITY.saturating_sub(diff);
            fills.push(last.to_sample(gains, self.decoding, quality, SampleOrigin::GapFill, false));
            diff -= 1;
        }
        self.last = Some(last);
        self.stats.gap_fills += fills.len() as u64;
        Some(fills)
    }

    /// Placeholder emitted when the transport stays silent.
    /// Sequence bookkeeping is left untouched.
    pub fn heartbeat(&mut self, gains: &GainVector) -> Sample {
        self.stats.heartbeats += 1;
        match self.last {
            Some(frame) => frame.to_sample(gains, self.decoding, 0, SampleOrigin::Heartbeat, false),
            None => Sample::silent(0, SampleOrigin::Heartbeat),
        }
    }

    /// Forget the previous frame and the sync counter ahead of a device reset
    pub fn reset(&mut self) {
        self.state = ReadState::SeekHeader;
        self.cursor = 0;
        self.last = None;
        self.good_frames = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bci_core::{ByteOrder, CHANNELS};

    pub(crate) fn frame_bytes(sequence: u8, code: i32) -> Vec<u8> {
        RawFrame::encode(sequence, &[code; CHANNELS], &[1, 2, 3], ByteOrder::BigEndian)
            .as_bytes()
            .to_vec()
    }

    /// A boundary byte followed by back-to-back frames
    pub(crate) fn stream(sequences: &[u8]) -> Vec<u8> {
        let mut bytes = vec![FOOTER];
        for &seq in sequences {
            bytes.extend(frame_bytes(seq, i32::from(seq) * 100));
        }
        bytes
    }

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Sample> {
        let gains = GainVector::default();
        let mut samples = Vec::new();
        for &b in bytes {
            match decoder.push(b, &gains) {
                Some(DecodeEvent::GapFill(fills)) => samples.extend(fills),
                Some(DecodeEvent::Frame(sample)) => samples.push(sample),
                None => {}
            }
        }
        samples
    }

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(2, FieldDecoding::default())
    }

    #[test]
    fn test_seq_diff_wraparound() {
        assert_eq!(seq_diff(255, 254), 1);
        assert_eq!(seq_diff(0, 255), 1);
        assert_eq!(seq_diff(0, 0), 255);
        assert_eq!(seq_diff(5, 1), 4);
        assert_eq!(seq_diff(5, 255), 6);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut decoder = decoder();
        let samples = decode_all(&mut decoder, &stream(&[10, 11, 12, 13, 14]));

        let sequences: Vec<u8> = samples.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![10, 11, 12, 13, 14]);
        assert!(samples.iter().all(|s| s.origin == SampleOrigin::Decoded && s.quality == 100));
        assert_eq!(samples[0].aux, [1, 2, 3]);
        // First three frames lock on, the rest are trusted
        let aligned: Vec<bool> = samples.iter().map(|s| s.frame_aligned).collect();
        assert_eq!(aligned, vec![false, false, false, true, true]);
        assert_eq!(decoder.state(), ReadState::SeekType);
    }

    #[test]
    fn test_gap_fill_count_and_order() {
        let mut decoder = decoder();
        let skipped = 4u8;
        let samples = decode_all(&mut decoder, &stream(&[20, 20 + skipped + 1]));

        assert_eq!(samples.len(), 2 + usize::from(skipped));
        assert_eq!(samples.first().unwrap().sequence, 20);
        assert_eq!(samples.last().unwrap().sequence, 25);

        let fills = &samples[1..samples.len() - 1];
        let sequences: Vec<u8> = fills.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![21, 22, 23, 24]);
        assert!(fills.iter().all(|s| s.origin == SampleOrigin::GapFill && !s.frame_aligned));
        // Quality degrades with the size of the remaining gap
        let quality: Vec<u8> = fills.iter().map(|s| s.quality).collect();
        assert_eq!(quality, vec![95, 96, 97, 98]);
        // Fills repeat the payload of the last good frame
        assert_eq!(fills[0].channels, samples[0].channels);
        assert_eq!(decoder.stats().gap_fills, 4);
    }

    #[test]
    fn test_gap_across_wraparound() {
        let mut decoder = decoder();
        let samples = decode_all(&mut decoder, &stream(&[254, 1]));
        let sequences: Vec<u8> = samples.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![254, 255, 0, 1]);
    }

    #[test]
    fn test_duplicate_sequence_forces_resync_fill() {
        let mut decoder = decoder();
        let samples = decode_all(&mut decoder, &stream(&[7, 7]));
        // 254 placeholders, then the repeated frame
        assert_eq!(samples.len(), 256);
        assert_eq!(samples[1].sequence, 8);
        assert_eq!(samples[1].quality, 0);
        assert_eq!(samples[254].sequence, 5);
        assert_eq!(samples[255].origin, SampleOrigin::Decoded);
    }

    #[test]
    fn test_no_gap_check_before_first_frame() {
        let mut decoder = decoder();
        let samples = decode_all(&mut decoder, &stream(&[0]));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].origin, SampleOrigin::Decoded);
    }

    #[test]
    fn test_desync_recovery() {
        let mut decoder = decoder();
        let mut bytes = stream(&[1]);
        let mut corrupt = frame_bytes(2, 7);
        corrupt[32] = 0x55;
        bytes.extend(corrupt);
        bytes.extend([0x13, 0x37]);
        bytes.push(FOOTER);
        bytes.extend(frame_bytes(3, 9));

        let samples = decode_all(&mut decoder, &bytes);

        let sequences: Vec<u8> = samples.iter().map(|s| s.sequence).collect();
        // The corrupt frame leaves no partial sample, its slot is filled
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(samples[1].origin, SampleOrigin::GapFill);
        assert_eq!(samples[2].origin, SampleOrigin::Decoded);
        let expected = bci_core::scale(9, GainVector::DEFAULT_GAIN, bci_core::ScaleUnit::Microvolts);
        assert!((samples[2].channels[0] - expected).abs() < 1e-9);
        assert_eq!(decoder.stats().desyncs, 1);
    }

    #[test]
    fn test_header_without_boundary_is_ignored() {
        let mut decoder = decoder();
        let mut bytes = frame_bytes(1, 5);
        bytes.extend(frame_bytes(2, 5));
        let samples = decode_all(&mut decoder, &bytes);
        // Only the second frame is preceded by a footer
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].sequence, 2);
    }

    #[test]
    fn test_heartbeat_repeats_last_frame_without_advancing() {
        let mut decoder = decoder();
        let gains = GainVector::default();

        let silent = decoder.heartbeat(&gains);
        assert_eq!(silent.origin, SampleOrigin::Heartbeat);
        assert_eq!(silent.channels, [0.0; CHANNELS]);

        let samples = decode_all(&mut decoder, &stream(&[40]));
        let beat = decoder.heartbeat(&gains);
        assert_eq!(beat.sequence, 40);
        assert_eq!(beat.quality, 0);
        assert_eq!(beat.channels, samples[0].channels);

        // Next frame follows on without a gap
        let next = decode_all(&mut decoder, &frame_bytes(41, 0));
        assert_eq!(next.len(), 1);
        assert_eq!(decoder.stats().heartbeats, 2);
    }

    #[test]
    fn test_reset_forgets_previous_frame() {
        let mut decoder = decoder();
        decode_all(&mut decoder, &stream(&[1, 2, 3, 4]));
        assert!(decoder.is_synced());

        decoder.reset();
        assert!(!decoder.is_synced());
        assert_eq!(decoder.state(), ReadState::SeekHeader);

        let samples = decode_all(&mut decoder, &stream(&[100]));
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_gains_apply_per_frame() {
        let mut decoder = decoder();
        let bytes = stream(&[1]);
        let unity = GainVector::uniform(1.0).unwrap();
        let mut out = None;
        for &b in &bytes {
            if let Some(DecodeEvent::Frame(s)) = decoder.push(b, &unity) {
                out = Some(s);
            }
        }
        let at_unity = out.unwrap();
        let at_default = decode_all(&mut FrameDecoder::new(2, FieldDecoding::default()), &bytes);
        assert!((at_unity.channels[0] - 24.0 * at_default[0].channels[0]).abs() < 1e-6);
    }
}
