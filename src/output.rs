//! Progress and diagnostics shown to the user.

use std::io::{self, Write};

/// Where a batch reports its progress and warnings.
pub trait Sink {
    fn progress_start(&mut self, total: usize) -> io::Result<()>;

    fn progress_advance(&mut self, steps: usize) -> io::Result<()>;

    fn progress_finish(&mut self) -> io::Result<()>;

    /// Shows a non-fatal problem.
    fn warning(&mut self, message: &str) -> io::Result<()>;
}

const BAR_WIDTH: usize = 28;

/// Terminal sink writing a single progress line and warnings to `out`.
pub struct Console<W: Write> {
    out: W,
    progress: bool,
    ansi: bool,
    total: usize,
    done: usize,
}

impl<W: Write> Console<W> {
    pub fn new(out: W, progress: bool, ansi: bool) -> Self {
        Self {
            out,
            progress,
            ansi,
            total: 0,
            done: 0,
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self) -> io::Result<()> {
        if !self.progress || self.total == 0 {
            return Ok(());
        }
        let filled = BAR_WIDTH * self.done / self.total;
        write!(
            self.out,
            "\r {:>width$}/{} [{}{}]",
            self.done,
            self.total,
            "=".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
            width = self.total.to_string().len(),
        )?;
        self.out.flush()
    }
}

impl<W: Write> Sink for Console<W> {
    fn progress_start(&mut self, total: usize) -> io::Result<()> {
        self.total = total;
        self.done = 0;
        self.draw()
    }

    fn progress_advance(&mut self, steps: usize) -> io::Result<()> {
        self.done = (self.done + steps).min(self.total);
        self.draw()
    }

    fn progress_finish(&mut self) -> io::Result<()> {
        if self.progress && self.total > 0 {
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn warning(&mut self, message: &str) -> io::Result<()> {
        if self.ansi {
            writeln!(self.out, "\x1b[33mWarning:\x1b[0m {}", message)
        } else {
            writeln!(self.out, "Warning: {}", message)
        }
    }
}
