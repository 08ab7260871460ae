use serde::Serialize;

/// Per-request synthesis metrics, written once when the request is
/// finalized and read by whatever reporter sits downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub ttfb_ms: u64,
    pub total_audio_ms: u64,
    pub byte_count: usize,
}

/// Playable duration of raw PCM, from the declared session format:
/// byte_count / (sample_rate * channels * bytes_per_sample), in milliseconds.
pub fn audio_duration_ms(
    byte_count: usize,
    samplerate: u32,
    channels: u32,
    bits_per_sample: u32,
) -> u64 {
    let bytes_per_second = samplerate as u64 * channels as u64 * (bits_per_sample as u64 / 8);
    if bytes_per_second == 0 {
        return 0;
    }
    byte_count as u64 * 1000 / bytes_per_second
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_formula() {
        // 16kHz mono s16le: 32000 bytes per second
        assert_eq!(audio_duration_ms(32000, 16000, 1, 16), 1000);
        assert_eq!(audio_duration_ms(16000, 16000, 1, 16), 500);
        // stereo halves the duration for the same byte count
        assert_eq!(audio_duration_ms(32000, 16000, 2, 16), 500);
        // 8-bit doubles it
        assert_eq!(audio_duration_ms(32000, 16000, 1, 8), 2000);
        assert_eq!(audio_duration_ms(0, 16000, 1, 16), 0);
    }

    #[test]
    fn test_duration_degenerate_format() {
        assert_eq!(audio_duration_ms(32000, 0, 1, 16), 0);
    }
}
