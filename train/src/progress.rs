use std::io::{self, Write};

/// A single, overwritten progress line.
pub struct ProgressLine<W: Write> {
    out: W,
    prefix: String,
    total: usize,
    done: usize,
}

impl ProgressLine<io::Stderr> {
    pub fn stderr(prefix: &str, total: usize) -> Self {
        Self::new(io::stderr(), prefix, total)
    }
}

impl<W: Write> ProgressLine<W> {
    pub fn new(out: W, prefix: &str, total: usize) -> Self {
        Self {
            out,
            prefix: prefix.to_owned(),
            total,
            done: 0,
        }
    }

    /// Integer percentage of finished items. Never decreases, 100 once all are done.
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            return 100;
        }
        self.done.min(self.total) * 100 / self.total
    }

    /// Marks `done` items finished and redraws.
    pub fn update(&mut self, done: usize) -> io::Result<()> {
        self.done = self.done.max(done);
        write!(
            self.out,
            "\r{} {:3}% ({}/{})",
            self.prefix,
            self.percent(),
            self.done.min(self.total),
            self.total
        )?;
        self.out.flush()
    }

    pub fn inc(&mut self) -> io::Result<()> {
        self.update(self.done + 1)
    }

    /// Ends the line.
    pub fn finish(mut self) -> io::Result<W> {
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(self.out)
    }
}
