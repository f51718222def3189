//! CLI utilities for sweepcache.
//!
//! The utilities present in this module back the interactive client: each line
//! names a sweep to fetch, or one of the dot commands.
use std::io::{BufRead, Write};

use serde_json::Value;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Cache diagnostics `.stats`
    Stats,
    /// Fetch a sweep: `<path> [tarinfo-json]`
    Get { path: String, tarinfo: Option<Value> },
}

/// Prompt user for a valid command.
///
/// End of input is treated as `.exit`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| format!("failed to write prompt: {e}"))?;
    writer
        .flush()
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if read == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Command::Exit),
        ".stats" => Ok(Command::Stats),
        "" => Err("no path provided".to_string()),
        s if s.starts_with('.') => Err(format!("unrecognized command '{s}'")),
        s => {
            let (path, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
            let tarinfo = match rest.trim() {
                "" => None,
                json => Some(
                    serde_json::from_str(json).map_err(|e| format!("invalid tarinfo: {e}"))?,
                ),
            };
            Ok(Command::Get {
                path: path.to_string(),
                tarinfo,
            })
        }
    }
}
