//! Logging configuration: level selection, optional size-capped rotating log
//! files, and a quiet mode that drops everything.

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_FILE_COUNT: usize = 1;

/// Where `-L file,maxMB,count` sends the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateSpec {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub count: usize,
}

/// Parse the `filename,maxsize-in-Mb,count` argument. Size and count are
/// optional and default to 10Mb and 1.
pub fn parse_log_spec(spec: &str) -> Result<RotateSpec, String> {
    let mut parts = spec.split(',');

    let path = parts.next().unwrap_or("").trim();
    if path.is_empty() {
        return Err("no log file specified".to_string());
    }

    let max_bytes = match parts.next() {
        Some(mb) => {
            let mb: u64 = mb
                .trim()
                .parse()
                .map_err(|_| "max size must be an integer".to_string())?;
            mb * 1024 * 1024
        }
        None => DEFAULT_MAX_BYTES,
    };

    let count = match parts.next() {
        Some(count) => count
            .trim()
            .parse()
            .map_err(|_| "count of logfiles must be an integer".to_string())?,
        None => DEFAULT_FILE_COUNT,
    };

    Ok(RotateSpec {
        path: PathBuf::from(path),
        max_bytes,
        count: count.max(1),
    })
}

/// Parse `-e LEVEL`: one of DEBUG, INFO, WARNING, ERROR.
pub fn parse_level(level: &str) -> Result<LevelFilter, String> {
    match level.trim().to_uppercase().as_str() {
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "WARNING" => Ok(LevelFilter::Warn),
        "ERROR" => Ok(LevelFilter::Error),
        other => Err(format!(
            "unknown log level {:?}, expected one of DEBUG, INFO, WARNING, ERROR",
            other
        )),
    }
}

/// Initialise the global logger. `quiet` drops every record, `rotate` sends
/// records to a rotating file instead of stderr.
pub fn init(level: LevelFilter, quiet: bool, rotate: Option<RotateSpec>) -> io::Result<()> {
    let mut builder = Builder::new();

    if quiet {
        builder.filter_level(LevelFilter::Off);
        builder.init();
        return Ok(());
    }

    builder.filter_level(level);
    if let Some(spec) = rotate {
        let writer = RotatingWriter::open(spec)?;
        builder.target(Target::Pipe(Box::new(writer)));
    }
    builder.init();
    Ok(())
}

/// An append writer that renames the file through numbered backups
/// (`log`, `log.0`, `log.1`, …) once it grows past the cap.
pub struct RotatingWriter {
    spec: RotateSpec,
    file: File,
    written: u64,
}

impl RotatingWriter {
    pub fn open(spec: RotateSpec) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&spec.path)?;
        let written = file.metadata()?.len();
        Ok(RotatingWriter { spec, file, written })
    }

    fn backup_path(path: &Path, index: usize) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        for index in (0..self.spec.count.saturating_sub(1)).rev() {
            let from = Self::backup_path(&self.spec.path, index);
            if from.exists() {
                let _ = std::fs::rename(&from, Self::backup_path(&self.spec.path, index + 1));
            }
        }
        let _ = std::fs::rename(&self.spec.path, Self::backup_path(&self.spec.path, 0));

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spec.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.spec.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_spec_defaults_size_and_count() {
        let spec = parse_log_spec("logs/mtpfs.log").unwrap();
        assert_eq!(spec.path, PathBuf::from("logs/mtpfs.log"));
        assert_eq!(spec.max_bytes, 10 * 1024 * 1024);
        assert_eq!(spec.count, 1);
    }

    #[test]
    fn log_spec_parses_size_and_count() {
        let spec = parse_log_spec("mtpfs.log,8,5").unwrap();
        assert_eq!(spec.max_bytes, 8 * 1024 * 1024);
        assert_eq!(spec.count, 5);
    }

    #[test]
    fn log_spec_rejects_bad_arguments() {
        assert!(parse_log_spec("").is_err());
        assert!(parse_log_spec("  ,8").is_err());
        assert!(parse_log_spec("log,eight").is_err());
        assert!(parse_log_spec("log,8,many").is_err());
    }

    #[test]
    fn levels_parse_like_the_option_help_says() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_level("WARNING").unwrap(), LevelFilter::Warn);
        assert_eq!(parse_level(" error ").unwrap(), LevelFilter::Error);
        assert!(parse_level("chatty").is_err());
    }

    #[test]
    fn writer_rotates_through_numbered_backups() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.log");
        let spec = RotateSpec {
            path: path.clone(),
            max_bytes: 16,
            count: 2,
        };

        let mut writer = RotatingWriter::open(spec)?;
        writer.write_all(b"0123456789")?;
        writer.write_all(b"0123456789")?; // pushes past the cap
        writer.write_all(b"ab")?;
        writer.flush()?;

        assert!(path.exists());
        assert!(RotatingWriter::backup_path(&path, 0).exists());
        Ok(())
    }
}
