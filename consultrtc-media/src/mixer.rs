//! Audio mixing
//!
//! Every input is down-mixed to mono and resampled to the mixer rate on
//! arrival, then buffered. Each tick pops one frame's worth of samples per
//! input (zero-padded when short), sums them and clamps to [-1, 1].

use crate::tracks::AudioFrame;
use std::collections::VecDeque;

/// Default mixer sample rate
pub const MIX_SAMPLE_RATE: u32 = 48_000;
/// Default mix interval in milliseconds
pub const MIX_INTERVAL_MS: u64 = 20;

// Bound per-input buffering to one second
const MAX_BUFFERED_MS: u64 = 1000;

#[derive(Debug)]
struct MixerInput {
    source_id: String,
    buffer: VecDeque<f32>,
}

/// Sums several audio sources into one mono signal
#[derive(Debug)]
pub struct AudioMixer {
    sample_rate: u32,
    frame_samples: usize,
    max_buffered: usize,
    inputs: Vec<MixerInput>,
}

impl AudioMixer {
    /// Mixer producing `frame_ms` frames at `sample_rate`
    pub fn new(sample_rate: u32, frame_ms: u64) -> Self {
        Self {
            sample_rate,
            frame_samples: (sample_rate as u64 * frame_ms / 1000) as usize,
            max_buffered: (sample_rate as u64 * MAX_BUFFERED_MS / 1000) as usize,
            inputs: Vec::new(),
        }
    }

    /// Register a source. Returns false if it is already registered.
    pub fn add_input(&mut self, source_id: &str) -> bool {
        if self.inputs.iter().any(|i| i.source_id == source_id) {
            return false;
        }
        self.inputs.push(MixerInput {
            source_id: source_id.to_string(),
            buffer: VecDeque::new(),
        });
        true
    }

    /// Unregister a source
    pub fn remove_input(&mut self, source_id: &str) -> bool {
        let before = self.inputs.len();
        self.inputs.retain(|i| i.source_id != source_id);
        self.inputs.len() != before
    }

    /// Number of registered sources
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Samples per mixed frame
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Buffer a frame from `source_id`. Unknown sources are ignored.
    pub fn push(&mut self, source_id: &str, frame: &AudioFrame) -> bool {
        let sample_rate = self.sample_rate;
        let max_buffered = self.max_buffered;
        let Some(input) = self.inputs.iter_mut().find(|i| i.source_id == source_id) else {
            return false;
        };
        let mono = downmix(&frame.samples, frame.channels);
        input
            .buffer
            .extend(resample(&mono, frame.sample_rate, sample_rate));
        let overflow = input.buffer.len().saturating_sub(max_buffered);
        input.buffer.drain(..overflow);
        true
    }

    /// Produce the next mixed frame
    pub fn mix(&mut self, timestamp: u64) -> AudioFrame {
        let mut samples = vec![0.0f32; self.frame_samples];
        for input in &mut self.inputs {
            let available = input.buffer.len().min(self.frame_samples);
            for (out, sample) in samples.iter_mut().zip(input.buffer.drain(..available)) {
                *out += sample;
            }
        }
        for sample in &mut samples {
            *sample = sample.clamp(-1.0, 1.0);
        }
        AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: 1,
            timestamp,
        }
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new(MIX_SAMPLE_RATE, MIX_INTERVAL_MS)
    }
}

/// Average interleaved channels into mono
fn downmix(samples: &[f32], channels: u8) -> Vec<f32> {
    match channels {
        0 | 1 => samples.to_vec(),
        n => samples
            .chunks(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect(),
    }
}

/// Linear-interpolation resampling
fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = position as usize;
            let fraction = (position - index as f64) as f32;
            let current = samples[index.min(samples.len() - 1)];
            let next = samples[(index + 1).min(samples.len() - 1)];
            current + (next - current) * fraction
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>, sample_rate: u32, channels: u8) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate,
            channels,
            timestamp: 0,
        }
    }

    #[test]
    fn test_sum_and_clamp() {
        let mut mixer = AudioMixer::new(1000, 4);
        assert!(mixer.add_input("a"));
        assert!(mixer.add_input("b"));
        assert!(!mixer.add_input("a"));

        mixer.push("a", &frame(vec![0.75, 0.5, -0.75, 0.1], 1000, 1));
        mixer.push("b", &frame(vec![0.75, 0.25, -0.75], 1000, 1));
        let mixed = mixer.mix(20);
        assert_eq!(mixed.samples, vec![1.0, 0.75, -1.0, 0.1]);
        assert_eq!(mixed.channels, 1);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut mixer = AudioMixer::new(1000, 2);
        mixer.add_input("stereo");
        mixer.push("stereo", &frame(vec![1.0, 0.0, 0.5, 0.5], 1000, 2));
        assert_eq!(mixer.mix(0).samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_to_mixer_rate() {
        let mut mixer = AudioMixer::new(48_000, 20);
        mixer.add_input("narrowband");
        mixer.push("narrowband", &frame(vec![0.2; 160], 8_000, 1));
        let mixed = mixer.mix(0);
        assert_eq!(mixed.samples.len(), 960);
        assert!(mixed.samples.iter().all(|s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_unknown_source_ignored_and_silence_without_inputs() {
        let mut mixer = AudioMixer::default();
        assert!(!mixer.push("ghost", &frame(vec![1.0; 960], 48_000, 1)));
        let mixed = mixer.mix(0);
        assert_eq!(mixed.samples.len(), 960);
        assert!(mixed.samples.iter().all(|s| *s == 0.0));
    }
}
