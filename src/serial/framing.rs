use serde::{Deserialize, Serialize};

/// Framing constants for the classroom kit wire format:
/// packet = [0x02][20 payload bytes][0x03], 22 bytes total.
pub const CLASSROOM_FRAMING: FramingConfig = FramingConfig {
    packet_len: 22,
    start_mark: 0x02,
    end_mark: 0x03,
};

/// Fixed-length sentinel framing parameters for one hardware kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Total packet length including both marks.
    pub packet_len: usize,
    /// Byte value opening every packet.
    pub start_mark: u8,
    /// Byte value closing every packet.
    pub end_mark: u8,
}

/// Stateful decoder turning an arbitrarily-chunked byte stream into
/// fixed-length packets bounded by start/end marks.
///
/// An instance is tied to one continuous stream: create a fresh decoder per
/// port open and discard it on close. Bytes of a partial frame are held
/// until the frame completes; a stream that ends mid-frame loses that frame.
pub struct FrameDecoder {
    config: FramingConfig,
    window: Vec<u8>,
    filled: usize,
    resync_count: u64,
}

impl FrameDecoder {
    /// # Panics
    ///
    /// Panics when `config.packet_len` is less than 2: a packet carries at
    /// least the start and end marks.
    pub fn new(config: FramingConfig) -> Self {
        assert!(config.packet_len >= 2, "packet must hold both marks");
        Self {
            window: vec![0; config.packet_len],
            filled: 0,
            resync_count: 0,
            config,
        }
    }

    pub fn config(&self) -> FramingConfig {
        self.config
    }

    /// Number of buffered bytes belonging to a not-yet-complete frame.
    pub fn pending(&self) -> usize {
        self.filled
    }

    /// How many times the decoder had to resynchronize after a bad window.
    pub fn resync_count(&self) -> u64 {
        self.resync_count
    }

    /// Feed a chunk of raw bytes; returns every packet completed by it.
    ///
    /// Packet boundaries never depend on chunk boundaries: feeding a stream
    /// byte-by-byte or in one call yields the same packets.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        for &byte in chunk {
            if self.filled == 0 {
                // Hunting for a frame start; everything else is noise.
                if byte != self.config.start_mark {
                    continue;
                }
                self.window[0] = byte;
                self.filled = 1;
            } else {
                self.window[self.filled] = byte;
                self.filled += 1;
            }

            if self.filled == self.config.packet_len {
                if byte == self.config.end_mark {
                    packets.push(self.window.clone());
                    self.filled = 0;
                } else {
                    self.resync();
                }
            }
        }

        packets
    }

    /// Recover from a window whose final byte is not the end mark.
    ///
    /// The stale window is searched for a later start mark at indices
    /// 1 ..= packet_len - 2; a start mark sitting in the final slot is
    /// dropped together with the window.
    fn resync(&mut self) {
        self.resync_count += 1;
        let len = self.config.packet_len;
        match self.window[1..len - 1]
            .iter()
            .position(|&b| b == self.config.start_mark)
        {
            Some(found) => {
                let start = found + 1;
                self.window.copy_within(start..len, 0);
                self.filled = len - start;
            }
            None => self.filled = 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload_byte: u8) -> Vec<u8> {
        let mut bytes = vec![0x02];
        bytes.extend(std::iter::repeat(payload_byte).take(20));
        bytes.push(0x03);
        bytes
    }

    #[test]
    fn test_single_packet_emitted_exactly() {
        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);
        let input = frame(0x41);
        let packets = decoder.push(&input);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], input);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_noise_without_start_mark_emits_nothing() {
        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);
        let noise = vec![0x00, 0x55, 0xAA, 0xFF, 0x10, 0x03];
        assert!(decoder.push(&noise).is_empty());
        assert_eq!(decoder.pending(), 0);

        let packets = decoder.push(&frame(0x42));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], frame(0x42));
    }

    #[test]
    fn test_spurious_start_mark_recovers_next_frame() {
        // A 0x02 inserted at byte 5 shifts the real end mark off the final
        // slot; the decoder must still frame the following packet.
        let mut corrupt = frame(0x10);
        corrupt.insert(5, 0x02);

        let mut stream = corrupt;
        stream.extend(frame(0x20));

        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);
        let packets = decoder.push(&stream);
        assert_eq!(packets, vec![frame(0x20)]);
        assert!(decoder.resync_count() >= 1);
    }

    #[test]
    fn test_consecutive_start_marks_do_not_desync() {
        let mut stream = vec![0x02];
        stream.extend(frame(0x33));

        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);
        let packets = decoder.push(&stream);
        assert_eq!(packets, vec![frame(0x33)]);
    }

    #[test]
    fn test_start_mark_in_final_slot_dropped() {
        // Window of junk whose last byte is a start mark: the resync search
        // stops short of the final slot, so that mark is lost and the frame
        // it opened never assembles.
        let mut stream = vec![0x02];
        stream.extend(std::iter::repeat(0xAA).take(20));
        stream.push(0x02);
        let lost = frame(0x44);
        stream.extend(&lost[1..]);

        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);
        assert!(decoder.push(&stream).is_empty());

        // The stream recovers as soon as a complete frame arrives.
        let packets = decoder.push(&frame(0x55));
        assert_eq!(packets, vec![frame(0x55)]);
    }

    #[test]
    fn test_bad_end_mark_without_inner_start_resets() {
        let mut stream = vec![0x02];
        stream.extend(std::iter::repeat(0x11).take(21));

        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);
        assert!(decoder.push(&stream).is_empty());
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.resync_count(), 1);
    }

    #[test]
    #[should_panic(expected = "packet must hold both marks")]
    fn test_rejects_packet_len_below_two() {
        FrameDecoder::new(FramingConfig {
            packet_len: 1,
            start_mark: 0x02,
            end_mark: 0x03,
        });
    }

    #[test]
    fn test_partial_frame_held_until_completed() {
        let input = frame(0x66);
        let mut decoder = FrameDecoder::new(CLASSROOM_FRAMING);

        assert!(decoder.push(&input[..6]).is_empty());
        assert_eq!(decoder.pending(), 6);

        let packets = decoder.push(&input[6..]);
        assert_eq!(packets, vec![input]);
        assert_eq!(decoder.pending(), 0);
    }
}
