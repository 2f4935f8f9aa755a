//! Sample sources of the two audio engines.
//!
//! - [`ToneSynth`] is a sine oscillator whose parameters (`freq`, `amp`, `duration`)
//!   are set by a `calc` program. Reloading only changes parameters, the phase carries
//!   on so a hot reload does not click.
//! - [`ScriptedSource`] evaluates a `calc` program once per frame with `t` (seconds)
//!   and `n` (frame index) set, and plays whatever the program assigns to `out`.
//!
//! Both commit a reload only when the new source ran cleanly; a rejected reload leaves
//! the previous parameters/program in place.

use std::f64::consts::TAU;

use crate::backends::SampleSource;
use crate::backends::calc::{Calc, Program};
use crate::config::AudioFormat;
use crate::error::Diagnostic;

/// Sine oscillator driven by `freq`, `amp` and optional `duration` (seconds).
#[derive(Debug, Clone)]
pub struct ToneSynth {
    calc: Calc,
    phase: f64,
    frames: u64,
}

impl Default for ToneSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl ToneSynth {
    pub fn new() -> Self {
        let mut calc = Calc::new();
        calc.set("freq", 440.0);
        calc.set("amp", 0.2);
        Self {
            calc,
            phase: 0.0,
            frames: 0,
        }
    }

    /// Current oscillator phase in radians, in `[0, 2π)`.
    pub fn phase(&self) -> f64 {
        self.phase
    }

    fn param(&self, name: &str) -> f64 {
        self.calc.get(name).unwrap_or_default()
    }
}

impl SampleSource for ToneSynth {
    fn load(&mut self, _title: &str, source: &str) -> Result<(), Diagnostic> {
        let mut staged = self.calc.clone();
        staged.exec(source)?;
        let freq = staged.get("freq").unwrap_or_default();
        if !freq.is_finite() || freq < 0.0 {
            return Err(Diagnostic::new(
                "ValueError",
                format!("freq must be a non-negative number, got {freq}"),
            ));
        }
        self.calc = staged;
        Ok(())
    }

    fn next_chunk(&mut self, format: &AudioFormat) -> Result<Option<Vec<f32>>, Diagnostic> {
        let rate = f64::from(format.sample_rate.max(1));
        if let Some(duration) = self.calc.get("duration") {
            if duration > 0.0 && self.frames as f64 / rate >= duration {
                return Ok(None);
            }
        }

        let (freq, amp) = (self.param("freq"), self.param("amp"));
        let step = TAU * freq / rate;
        let channels = usize::from(format.channels.max(1));
        let mut chunk = Vec::with_capacity(format.chunk_samples());
        for _ in 0..format.chunk_frames {
            let sample = (amp * self.phase.sin()) as f32;
            chunk.extend(std::iter::repeat_n(sample, channels));
            self.phase = (self.phase + step) % TAU;
        }
        self.frames += format.chunk_frames as u64;
        Ok(Some(chunk))
    }
}

/// Per-frame `calc` program producing `out`.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    calc: Calc,
    program: Option<Program>,
    frame: u64,
    finished: bool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn sample(calc: &mut Calc, program: &Program, frame: u64, rate: f64) -> Result<f64, Diagnostic> {
        calc.set("n", frame as f64);
        calc.set("t", frame as f64 / rate);
        calc.run(program)?;
        calc.get("out")
            .ok_or_else(|| Diagnostic::new("NameError", "name 'out' is not defined"))
    }
}

impl SampleSource for ScriptedSource {
    fn load(&mut self, _title: &str, source: &str) -> Result<(), Diagnostic> {
        let program = Program::parse(source)?;
        if !program.assigns("out") {
            return Err(Diagnostic::new("NameError", "name 'out' is not defined"));
        }
        // Dry run on a copy so a faulty reload never touches the live context.
        let mut staged = self.calc.clone();
        Self::sample(&mut staged, &program, self.frame, 44_100.0)?;
        self.program = Some(program);
        self.finished = false;
        Ok(())
    }

    fn next_chunk(&mut self, format: &AudioFormat) -> Result<Option<Vec<f32>>, Diagnostic> {
        let Some(program) = self.program.as_ref() else {
            return Ok(None);
        };
        if self.finished {
            return Ok(None);
        }

        let rate = f64::from(format.sample_rate.max(1));
        let channels = usize::from(format.channels.max(1));
        let mut chunk = Vec::with_capacity(format.chunk_samples());
        for _ in 0..format.chunk_frames {
            let out = Self::sample(&mut self.calc, program, self.frame, rate)?;
            chunk.extend(std::iter::repeat_n(out.clamp(-1.0, 1.0) as f32, channels));
            self.frame += 1;
            if self.calc.is_done() {
                self.finished = true;
                break;
            }
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(frames: usize) -> AudioFormat {
        AudioFormat {
            sample_rate: 1_000,
            channels: 1,
            chunk_frames: frames,
        }
    }

    #[test]
    fn test_tone_defaults_produce_full_chunks() {
        let fmt = AudioFormat::default();
        let mut synth = ToneSynth::new();
        synth.load("t", "").unwrap();
        let chunk = synth.next_chunk(&fmt).unwrap().unwrap();
        assert_eq!(chunk.len(), fmt.chunk_samples());
        assert!(chunk.iter().all(|s| s.abs() <= 0.2 + f32::EPSILON));
        // Stereo samples are duplicated per frame.
        assert_eq!(chunk[2], chunk[3]);
    }

    #[test]
    fn test_tone_reload_keeps_phase() {
        let fmt = mono(10);
        let mut synth = ToneSynth::new();
        synth.load("t", "freq = 30").unwrap();
        synth.next_chunk(&fmt).unwrap();
        let before = synth.phase();
        assert!(before > 0.0);

        synth.load("t", "freq = 200; amp = 0.5").unwrap();
        assert_eq!(synth.phase(), before);
        let chunk = synth.next_chunk(&fmt).unwrap().unwrap();
        assert!((f64::from(chunk[0]) - 0.5 * before.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_tone_rejected_reload_keeps_parameters() {
        let mut synth = ToneSynth::new();
        synth.load("t", "freq = 300").unwrap();
        let err = synth.load("t", "amp = 0.9\nfreq = nope").unwrap_err();
        assert_eq!(err.kind, "NameError");
        assert_eq!(err.line, Some(2));
        assert_eq!(synth.param("freq"), 300.0);
        assert_eq!(synth.param("amp"), 0.2);
    }

    #[test]
    fn test_tone_ends_after_duration() {
        let fmt = mono(100);
        let mut synth = ToneSynth::new();
        synth.load("t", "duration = 0.25").unwrap();
        let chunks = std::iter::from_fn(|| synth.next_chunk(&fmt).unwrap()).count();
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_scripted_source_sees_frame_index() {
        let fmt = mono(4);
        let mut src = ScriptedSource::new();
        src.load("t", "out = n / 8").unwrap();
        let a = src.next_chunk(&fmt).unwrap().unwrap();
        let b = src.next_chunk(&fmt).unwrap().unwrap();
        assert_eq!(a, vec![0.0, 0.125, 0.25, 0.375]);
        assert_eq!(b, vec![0.5, 0.625, 0.75, 0.875]);
    }

    #[test]
    fn test_scripted_source_requires_out() {
        let mut src = ScriptedSource::new();
        let err = src.load("t", "x = 1").unwrap_err();
        assert_eq!(err.kind, "NameError");
        assert!(src.next_chunk(&mono(4)).unwrap().is_none());
    }

    #[test]
    fn test_scripted_source_stops_on_done() {
        let fmt = mono(4);
        let mut src = ScriptedSource::new();
        src.load("t", "out = 0\ndone = max(n - 3, 0)").unwrap();
        assert_eq!(src.next_chunk(&fmt).unwrap().unwrap().len(), 4);
        assert_eq!(src.next_chunk(&fmt).unwrap().unwrap().len(), 1);
        assert!(src.next_chunk(&fmt).unwrap().is_none());
    }

    #[test]
    fn test_scripted_source_runtime_error_carries_line() {
        let mut src = ScriptedSource::new();
        src.load("t", "out = 1 / (10 - n)").unwrap();
        let err = src.next_chunk(&mono(20)).unwrap_err();
        assert_eq!(err.kind, "ZeroDivisionError");
        assert_eq!(err.line, Some(1));
    }
}
