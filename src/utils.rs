use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

// Logging and terminal prompt helpers for the binary. The terminal is in raw
// mode while the UI runs, so log output goes to a file.

pub struct SimpleLogger {
    log_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&Path>) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };

        Ok(SimpleLogger { log_file })
    }

    fn format_record(record: &Record) -> String {
        let now: DateTime<Local> = Local::now();
        format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = Self::format_record(record);
        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
            None => print!("{}", line),
        }
    }

    fn flush(&self) {
        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.flush();
                }
            }
            None => {
                let _ = std::io::stdout().flush();
            }
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Print `label` and read the answer
pub fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    std::io::stdout().flush()?;
    read_line()
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use std::io::Read;

    #[test]
    fn test_record_format_has_level_and_location() {
        let line = SimpleLogger::format_record(
            &Record::builder()
                .args(format_args!("hello world"))
                .level(Level::Warn)
                .file(Some("src/chat/mod.rs"))
                .line(Some(42))
                .build(),
        );
        assert!(line.contains("WARN [src/chat/mod.rs:42] hello world"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_logger_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.log");
        let logger = SimpleLogger::new(Some(&path)).unwrap();

        log::set_max_level(LevelFilter::Info);
        log::Log::log(
            &logger,
            &Record::builder().args(format_args!("written")).level(Level::Info).build(),
        );
        log::Log::flush(&logger);

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("INFO [unknown:0] written"));
    }
}
