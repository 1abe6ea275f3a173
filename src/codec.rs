//! PCM codec utilities
//!
//! All functions operate on raw little-endian 16-bit PCM byte buffers and
//! have no external side effects. Samples are always clamped to the `i16`
//! range. Mirrors the linear-interpolation resampling approach used by
//! `AudioBuffer::resample`, adapted from floating-point samples to raw
//! PCM16 bytes.

/// Downmix interleaved stereo 16-bit PCM to mono 16-bit PCM by averaging the
/// two channels per frame. Trailing incomplete frames are dropped.
pub fn downmix_stereo16_to_mono16(bytes: &[u8]) -> Vec<u8> {
    let frame_bytes = 4; // 2 channels * 2 bytes
    let frames = bytes.len() / frame_bytes;
    let mut out = Vec::with_capacity(frames * 2);

    for frame in bytes.chunks_exact(frame_bytes).take(frames) {
        let left = i16::from_le_bytes([frame[0], frame[1]]) as i32;
        let right = i16::from_le_bytes([frame[2], frame[3]]) as i32;
        let mixed = clamp_i16(((left + right) / 2) as i32);
        out.extend_from_slice(&mixed.to_le_bytes());
    }

    out
}

/// Upmix mono 16-bit PCM to interleaved stereo by duplicating each sample
/// into both channels.
pub fn mono16_to_stereo16(bytes: &[u8]) -> Vec<u8> {
    let samples = bytes.len() / 2;
    let mut out = Vec::with_capacity(samples * 4);

    for sample in bytes.chunks_exact(2).take(samples) {
        out.extend_from_slice(sample);
        out.extend_from_slice(sample);
    }

    out
}

/// Resample mono 16-bit PCM from `in_rate_hz` to `out_rate_hz` using linear
/// interpolation. Inputs with fewer than two samples, or with a non-positive
/// rate on either side, produce empty output. Equal rates return a byte-wise
/// copy without resampling.
pub fn resample_mono16(bytes: &[u8], in_rate_hz: u32, out_rate_hz: u32) -> Vec<u8> {
    if in_rate_hz == out_rate_hz {
        return bytes.to_vec();
    }
    if in_rate_hz == 0 || out_rate_hz == 0 {
        return Vec::new();
    }

    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    if samples.len() < 2 {
        return Vec::new();
    }

    let ratio = out_rate_hz as f64 / in_rate_hz as f64;
    let new_len = ((samples.len() as f64) * ratio) as usize;
    let mut out = Vec::with_capacity(new_len * 2);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = src_idx - idx_floor as f64;

        let a = samples[idx_floor] as f64;
        let b = samples[idx_ceil] as f64;
        let interpolated = a * (1.0 - frac) + b * frac;
        let sample = clamp_i16(interpolated.round() as i32);
        out.extend_from_slice(&sample.to_le_bytes());
    }

    out
}

/// Encode mono 16-bit PCM as a canonical WAV byte buffer (16-bit, mono, at
/// `sample_rate_hz`).
pub fn encode_pcm16_mono_as_wav(pcm: &[u8], sample_rate_hz: u32) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sample_rate_hz,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // WavWriter over an in-memory cursor never fails for well-formed specs;
    // a truncated odd-length trailing byte is simply dropped.
    let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer spec is valid");
    for sample in pcm.chunks_exact(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        writer.write_sample(value).expect("in-memory wav write cannot fail");
    }
    writer.finalize().expect("in-memory wav finalize cannot fail");

    cursor.into_inner()
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16_from_samples(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn downmix_averages_channels() {
        // stereo frames: (left, right) = (100, 200), (-100, -300)
        let stereo = pcm16_from_samples(&[100, 200, -100, -300]);
        let mono = downmix_stereo16_to_mono16(&stereo);
        let samples: Vec<i16> = mono.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(samples, vec![150, -200]);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let mono = pcm16_from_samples(&[42, -42]);
        let stereo = mono16_to_stereo16(&mono);
        let samples: Vec<i16> = stereo.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(samples, vec![42, 42, -42, -42]);
    }

    #[test]
    fn roundtrip_preserves_frame_count() {
        let mono = pcm16_from_samples(&[10, 20, 30, -10, -20]);
        let stereo = mono16_to_stereo16(&mono);
        let back = downmix_stereo16_to_mono16(&stereo);
        assert_eq!(back.len(), mono.len());
    }

    #[test]
    fn resample_equal_rates_is_copy() {
        let mono = pcm16_from_samples(&[1, 2, 3, 4]);
        let out = resample_mono16(&mono, 24000, 24000);
        assert_eq!(out, mono);
    }

    #[test]
    fn resample_short_input_is_empty() {
        let mono = pcm16_from_samples(&[1]);
        let out = resample_mono16(&mono, 24000, 48000);
        assert!(out.is_empty());
    }

    #[test]
    fn resample_non_positive_rate_is_empty() {
        let mono = pcm16_from_samples(&[1, 2, 3]);
        assert!(resample_mono16(&mono, 0, 48000).is_empty());
        assert!(resample_mono16(&mono, 48000, 0).is_empty());
    }

    #[test]
    fn resample_upsamples_roughly_doubles_length() {
        let mono = pcm16_from_samples(&[0, 1000, 2000, 3000, 4000, 5000]);
        let out = resample_mono16(&mono, 24000, 48000);
        let samples = out.len() / 2;
        assert!(samples >= 10 && samples <= 14);
    }

    #[test]
    fn wav_header_has_riff_and_data_markers() {
        let pcm = pcm16_from_samples(&[0, 100, -100, 200]);
        let wav = encode_pcm16_mono_as_wav(&pcm, 24000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > pcm.len());
    }

    #[test]
    fn clamp_prevents_overflow() {
        assert_eq!(clamp_i16(i32::MAX), i16::MAX);
        assert_eq!(clamp_i16(i32::MIN), i16::MIN);
    }
}
