use std::io::{self, Write};

use serde::Serialize;

use crate::app::{LoadResult, RefreshResult};
use crate::domain::{DatasetRecord, SessionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human readable lines.
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sessions(sessions: &[SessionRecord]) -> io::Result<()> {
        Self::print_json(&sessions)
    }

    pub fn print_datasets(datasets: &[DatasetRecord]) -> io::Result<()> {
        Self::print_json(&datasets)
    }

    pub fn print_refresh(result: &RefreshResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_load(result: &LoadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_sessions(sessions: &[SessionRecord]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for session in sessions {
            writeln!(stdout, "{}  {}", session.id, session.session_path())?;
        }
        Ok(())
    }

    pub fn print_datasets(datasets: &[DatasetRecord]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for dataset in datasets {
            let marker = if dataset.exists { ' ' } else { '!' };
            writeln!(stdout, "{marker} {}  {}", dataset.rel_path, dataset.qc)?;
        }
        Ok(())
    }

    pub fn print_lines(lines: &[String]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for line in lines {
            if line.is_empty() {
                writeln!(stdout, "(root)")?;
            } else {
                writeln!(stdout, "{line}")?;
            }
        }
        Ok(())
    }

    pub fn print_load(result: &LoadResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for file in &result.files {
            match file {
                Some(path) => writeln!(stdout, "{path}")?,
                None => writeln!(stdout, "-")?,
            }
        }
        Ok(())
    }
}
