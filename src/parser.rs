//! Stdin parser.

use anyhow::Context;

/// How work items are separated in the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Separator {
    /// Any ASCII whitespace.
    Whitespace,
    /// NUL bytes only, so items may contain spaces and newlines.
    Nul,
}

/// Breaks down input bytes into work items.
pub struct Parser<F>
where
    F: FnMut(String) -> anyhow::Result<()>,
{
    separator: Separator,

    /// Item being parsed.
    item: Vec<u8>,

    /// Number of complete items seen so far.
    count: usize,

    /// Closure called with each complete item.
    action: F,
}

impl<F: FnMut(String) -> anyhow::Result<()>> Parser<F> {
    /// Creates a new parser that calls `action` with every item.
    pub fn new(separator: Separator, action: F) -> Self {
        Self {
            separator,
            item: Vec::new(),
            count: 0,
            action,
        }
    }

    /// Parses incoming byte.
    pub fn handle_byte(&mut self, ch: u8) -> anyhow::Result<()> {
        if self.is_separator(ch) {
            self.flush()
        } else {
            self.item.push(ch);
            Ok(())
        }
    }

    /// Flushes the last item on EOF.
    pub fn handle_eof(&mut self) -> anyhow::Result<()> {
        self.flush()
    }

    fn is_separator(&self, ch: u8) -> bool {
        match self.separator {
            Separator::Whitespace => ch.is_ascii_whitespace(),
            Separator::Nul => ch == 0,
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.item.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.item);
        self.count += 1;
        let item = String::from_utf8(bytes)
            .with_context(|| format!("Work item #{} is not valid UTF-8", self.count))?;
        (self.action)(item)
    }
}
