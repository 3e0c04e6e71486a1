use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use train::error::Result;
use train::export::save_png;
use train::report::{ImageSnapshot, Reporter};

/// One line of `events.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Scalar { key: String, value: f64, step: usize },
    Image { key: String, path: PathBuf, step: usize },
    Log { level: String, message: String },
}

/// Writes telemetry as JSON lines, with image snapshots as PNG files next to it.
pub struct EventReporter {
    dir: PathBuf,
    events: BufWriter<File>,
}

impl EventReporter {
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let events = File::create(dir.join("events.jsonl"))?;
        Ok(Self {
            dir: dir.to_owned(),
            events: BufWriter::new(events),
        })
    }

    fn write(&mut self, event: &Event) -> io::Result<()> {
        serde_json::to_writer(&mut self.events, event)?;
        self.events.write_all(b"\n")?;
        self.events.flush()
    }
}

impl Reporter for EventReporter {
    fn scalar(&mut self, key: &str, value: f64, step: usize) -> Result<()> {
        self.write(&Event::Scalar {
            key: key.to_owned(),
            value,
            step,
        })?;
        Ok(())
    }

    fn image(&mut self, key: &str, image: &ImageSnapshot, step: usize) -> Result<()> {
        let name = format!("{}_{step:03}.png", key.replace('/', "_"));
        let path = Path::new("images").join(name);
        save_png(image, &self.dir.join(&path))?;
        self.write(&Event::Image {
            key: key.to_owned(),
            path,
            step,
        })?;
        Ok(())
    }

    fn log(&mut self, level: log::Level, message: &str) {
        log::log!(level, "{message}");
        let event = Event::Log {
            level: level.to_string(),
            message: message.to_owned(),
        };
        if let Err(e) = self.write(&event) {
            log::warn!("Failed to write event log: {e}");
        }
    }
}
