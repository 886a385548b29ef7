// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Size-rotated file logging behind the `log` facade.
//!
//! Every logical log name gets `logs/<name>.log`, rotated to `<name>.log.1`,
//! `<name>.log.2`, ... Records whose target is `service:<service name>` go to
//! that service's file, everything else goes to the logger's default name.

use crate::error::{Error, Result};
use crate::lock;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const SERVICE_TARGET_PREFIX: &str = "service:";

/// Log target routing a record to the file of service `name`.
pub fn service_target(name: &str) -> String {
    format!("{SERVICE_TARGET_PREFIX}{name}")
}

/// Lowercase, with everything outside `[a-z0-9.]` replaced by `-`.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn manager_log_name(manager_name: &str) -> String {
    format!("{manager_name} manager")
}

pub fn client_log_name(manager_name: &str) -> String {
    format!("{manager_name} manager client")
}

struct Sink {
    path: PathBuf,
    file: File,
    size: u64,
}

pub struct FileLogger {
    dir: PathBuf,
    default_name: String,
    max_size: u64,
    max_files: u32,
    level: LevelFilter,
    echo: bool,
    sinks: Mutex<HashMap<String, Sink>>,
}

impl FileLogger {
    /// `max_files` counts the active file plus its rotated backups.
    pub fn new(dir: &Path, default_name: &str, max_size: u64, max_files: u32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            default_name: normalize_name(default_name),
            max_size,
            max_files: max_files.max(1),
            level: LevelFilter::Debug,
            echo: false,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// Also print the default log's INFO and above to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Install as the global `log` backend.
    pub fn init(self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::other(format!("Could not create log directory \"{}\"", self.dir.display()))
                .because_of(&e)
        })?;
        let level = self.level;
        log::set_boxed_logger(Box::new(self))
            .map_err(|e| Error::other("Could not install logger").because_of(&e))?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn log_path(&self, logical_name: &str) -> PathBuf {
        self.dir.join(format!("{}.log", normalize_name(logical_name)))
    }

    fn logical_name<'a>(&'a self, target: &'a str) -> &'a str {
        target
            .strip_prefix(SERVICE_TARGET_PREFIX)
            .unwrap_or(&self.default_name)
    }

    fn write_line(&self, logical_name: &str, line: &str) -> std::io::Result<()> {
        let name = normalize_name(logical_name);
        let mut sinks = lock(&self.sinks);

        if !sinks.contains_key(&name) {
            let sink = self.open(&name)?;
            sinks.insert(name.clone(), sink);
        }
        let Some(sink) = sinks.get_mut(&name) else {
            return Ok(());
        };

        let len = line.len() as u64;
        if sink.size > 0 && sink.size + len > self.max_size {
            sink.file.flush()?;
            self.rotate(&sink.path)?;
            *sink = self.open(&name)?;
        }
        sink.file.write_all(line.as_bytes())?;
        sink.size += len;
        Ok(())
    }

    fn open(&self, name: &str) -> std::io::Result<Sink> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Sink { path, file, size })
    }

    fn rotate(&self, path: &Path) -> std::io::Result<()> {
        let backup = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));
        let last = self.max_files.saturating_sub(1);
        if last == 0 {
            return fs::remove_file(path);
        }

        match fs::remove_file(backup(last)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        for n in (1..last).rev() {
            let from = backup(n);
            if from.exists() {
                fs::rename(&from, backup(n + 1))?;
            }
        }
        fs::rename(path, backup(1))
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let line = format!("{timestamp} {:<5} {}\n", record.level(), record.args());
        let target = record.target();
        let logical_name = self.logical_name(target);

        if self.echo
            && record.level() <= Level::Info
            && !target.starts_with(SERVICE_TARGET_PREFIX)
        {
            print!("{line}");
        }
        if let Err(e) = self.write_line(logical_name, &line) {
            eprintln!("could not write log \"{logical_name}\": {e}");
        }
    }

    fn flush(&self) {
        for sink in lock(&self.sinks).values_mut() {
            let _ = sink.file.flush();
        }
        let _ = std::io::stdout().flush();
    }
}
