// lazily yields the per-core memory reference stream from a trace file

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use log::warn;

use crate::commons::{Addr, MemOp, MemRef};

const PRELOAD: usize = 10;
const LOW_WATER: usize = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingAddress,
    BadOp(String),
    BadAddress(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingAddress => write!(f, "missing address field"),
            ParseError::BadOp(op) => write!(f, "unknown operation `{}`", op),
            ParseError::BadAddress(a) => write!(f, "unparsable address `{}`", a),
        }
    }
}

impl Error for ParseError {}

/// Parses one trace line. `Ok(None)` means the line carries nothing
/// (blank or comment) and should be silently skipped.
pub fn parse_line(line: &str) -> Result<Option<MemRef>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let op = match parts.next() {
        Some("R") | Some("r") => MemOp::Read,
        Some("W") | Some("w") => MemOp::Write,
        Some(other) => return Err(ParseError::BadOp(other.to_string())),
        None => return Ok(None),
    };
    let addr_str = parts.next().ok_or(ParseError::MissingAddress)?;
    let value = if let Some(hex) = addr_str
        .strip_prefix("0x")
        .or_else(|| addr_str.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        addr_str.parse::<u32>()
    }
    .map_err(|_| ParseError::BadAddress(addr_str.to_string()))?;
    Ok(Some(MemRef {
        op,
        addr: Addr(value),
    }))
}

pub struct TraceReader {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    queue: VecDeque<MemRef>,
}

impl TraceReader {
    /// Opens a trace file. A missing or unreadable file is not fatal:
    /// the reader starts out exhausted and the core simply has no work.
    pub fn open(path: impl AsRef<Path>) -> TraceReader {
        let path = path.as_ref().to_path_buf();
        let lines = match File::open(&path) {
            Ok(f) => Some(BufReader::new(f).lines()),
            Err(e) => {
                warn!("could not open trace file {}: {}", path.display(), e);
                None
            }
        };
        let mut reader = TraceReader {
            path,
            lines,
            queue: VecDeque::new(),
        };
        reader.preload(PRELOAD);
        reader
    }

    fn preload(&mut self, up_to: usize) {
        let mut exhausted = false;
        if let Some(lines) = self.lines.as_mut() {
            while self.queue.len() < up_to {
                match lines.next() {
                    Some(Ok(line)) => match parse_line(&line) {
                        Ok(Some(r)) => self.queue.push_back(r),
                        Ok(None) => {}
                        Err(e) => {
                            warn!("{}: skipping malformed line: {}", self.path.display(), e)
                        }
                    },
                    Some(Err(e)) => {
                        warn!("{}: read error: {}", self.path.display(), e);
                        exhausted = true;
                        break;
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
        }
        if exhausted {
            self.lines = None;
        }
    }

    /// Next reference, or `None` once the trace is fully consumed.
    pub fn next_ref(&mut self) -> Option<MemRef> {
        if self.queue.is_empty() {
            self.preload(PRELOAD);
        }
        let r = self.queue.pop_front();
        if self.queue.len() < LOW_WATER {
            self.preload(PRELOAD);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_read_and_write_ops() {
        let r = parse_line("R 0x40").unwrap().unwrap();
        assert_eq!(r.op, MemOp::Read);
        assert_eq!(r.addr, Addr(0x40));
        let w = parse_line("w 128").unwrap().unwrap();
        assert_eq!(w.op, MemOp::Write);
        assert_eq!(w.addr, Addr(128));
    }

    #[test]
    fn parses_uppercase_hex_prefix() {
        let r = parse_line("r 0XFF").unwrap().unwrap();
        assert_eq!(r.addr, Addr(0xFF));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# prefetch section").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(
            parse_line("X 0x40"),
            Err(ParseError::BadOp("X".to_string()))
        );
        assert_eq!(parse_line("R"), Err(ParseError::MissingAddress));
        assert_eq!(
            parse_line("R zzz"),
            Err(ParseError::BadAddress("zzz".to_string()))
        );
    }

    #[test]
    fn missing_file_yields_empty_stream() {
        let mut reader = TraceReader::open("/nonexistent/definitely_not_here.trace");
        assert!(reader.next_ref().is_none());
    }

    #[test]
    fn reads_through_file_skipping_junk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t_proc0.trace");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# header").unwrap();
        writeln!(f, "R 0x40").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "bogus line").unwrap();
        writeln!(f, "W 0x80").unwrap();
        drop(f);

        let mut reader = TraceReader::open(&path);
        let a = reader.next_ref().unwrap();
        let b = reader.next_ref().unwrap();
        assert_eq!((a.op, a.addr), (MemOp::Read, Addr(0x40)));
        assert_eq!((b.op, b.addr), (MemOp::Write, Addr(0x80)));
        assert!(reader.next_ref().is_none());
    }
}
