use base64::Engine;

/// Bytes per sample of 16-bit PCM.
const PCM16_SAMPLE_WIDTH: usize = 2;

/// Encodes raw little-endian PCM16 bytes for an `audio` frame.
pub fn encode_pcm_base64(pcm16: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16)
}

/// Playback length of a mono PCM16 buffer, in seconds.
pub fn pcm16_duration_secs(byte_len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    (byte_len / PCM16_SAMPLE_WIDTH) as f64 / sample_rate as f64
}
