use burn::prelude::{Backend, Tensor};

use crate::error::Result;
use crate::pyramid::to_host;

/// A host side [C, H, W] image.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageSnapshot {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageSnapshot {
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 3>) -> Result<Self> {
        let [channels, height, width] = tensor.dims();
        Ok(Self {
            channels,
            height,
            width,
            data: to_host(tensor)?,
        })
    }
}

/// Sink for run telemetry. Only the leader of a run writes to it.
pub trait Reporter {
    fn scalar(&mut self, key: &str, value: f64, step: usize) -> Result<()>;
    fn image(&mut self, key: &str, image: &ImageSnapshot, step: usize) -> Result<()>;
    fn log(&mut self, level: log::Level, message: &str);
}

/// Forwards everything to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn scalar(&mut self, key: &str, value: f64, step: usize) -> Result<()> {
        log::debug!("{key} = {value:.6} @ {step}");
        Ok(())
    }

    fn image(&mut self, key: &str, image: &ImageSnapshot, step: usize) -> Result<()> {
        log::debug!(
            "{key}: {}x{}x{} image @ {step}",
            image.channels,
            image.height,
            image.width
        );
        Ok(())
    }

    fn log(&mut self, level: log::Level, message: &str) {
        log::log!(level, "{message}");
    }
}

/// Keeps everything in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryReporter {
    pub scalars: Vec<(String, f64, usize)>,
    pub images: Vec<(String, ImageSnapshot, usize)>,
    pub lines: Vec<(log::Level, String)>,
}

impl MemoryReporter {
    /// Most recent value published under `key`.
    pub fn last_scalar(&self, key: &str) -> Option<f64> {
        self.scalars
            .iter()
            .rev()
            .find(|(k, _, _)| k == key)
            .map(|(_, v, _)| *v)
    }

    pub fn has_line(&self, needle: &str) -> bool {
        self.lines.iter().any(|(_, line)| line.contains(needle))
    }
}

impl Reporter for MemoryReporter {
    fn scalar(&mut self, key: &str, value: f64, step: usize) -> Result<()> {
        self.scalars.push((key.to_owned(), value, step));
        Ok(())
    }

    fn image(&mut self, key: &str, image: &ImageSnapshot, step: usize) -> Result<()> {
        self.images.push((key.to_owned(), image.clone(), step));
        Ok(())
    }

    fn log(&mut self, level: log::Level, message: &str) {
        log::log!(level, "{message}");
        self.lines.push((level, message.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn snapshot_keeps_layout() {
        let tensor = Tensor::<NdArray, 1>::from_floats([0.0, 0.5, 1.0, 0.25, 0.75, 0.125].as_slice(), &Default::default())
            .reshape([1, 2, 3]);
        let snapshot = ImageSnapshot::from_tensor(tensor).unwrap();
        assert_eq!((snapshot.channels, snapshot.height, snapshot.width), (1, 2, 3));
        assert_eq!(snapshot.data[4], 0.75);
    }

    #[test]
    fn memory_reporter_finds_latest() {
        let mut reporter = MemoryReporter::default();
        reporter.scalar("Train/loss", 0.5, 1).unwrap();
        reporter.scalar("Train/loss", 0.25, 2).unwrap();
        reporter.log(log::Level::Info, "Epoch[1/2]");
        assert_eq!(reporter.last_scalar("Train/loss"), Some(0.25));
        assert_eq!(reporter.last_scalar("Train/lr"), None);
        assert!(reporter.has_line("Epoch[1/2]"));
    }
}
