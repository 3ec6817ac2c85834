use std::io::Write;
use std::sync::Mutex;

/// Where human-readable chat text ends up: the server's console echo of
/// messages, or a client's display of `Stdout` records.
pub trait OutputSink: Send + Sync {
    fn write(&self, text: &str);
}

/// Prints to the process's standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Console;

impl OutputSink for Console {
    fn write(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        // A closed stdout is not worth tearing a connection down for.
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

/// Keeps everything written, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lines().iter().any(|line| line == text)
    }
}

impl OutputSink for MemorySink {
    fn write(&self, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(text.to_string());
        }
    }
}
