//! Text encoding resolution for source files.
//!
//! Source bytes arrive with unknown or ambiguous encodings. Statistical
//! detection is cheap and right most of the time; when its confidence is too
//! low the resolver falls back to asking the host process (and through it, the
//! user) instead of silently guessing and corrupting displayed source text.

use crate::error::Error;
use log::{debug, info};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Detection results below this confidence are not trusted.
const CONFIDENCE_THRESHOLD: f32 = 0.95;

/// Encodings the host offers to the user when asked for a choice. Includes
/// families the statistical detector cannot tell apart (or does not know at
/// all, like ISO-8859-1). Published for the host-side picker; the bridge
/// itself accepts whatever name comes back.
pub const POSSIBLE_ENCODINGS: &[&str] = &[
    "windows-1252",
    "ISO-8859-7",
    "ISO-8859-1",
    "ISO-8859-2",
    "ASCII",
    "UTF-8",
];

/// Side channel to the host process for interactive encoding selection.
///
/// Exactly one outstanding request per file load; the call blocks until the
/// host answers (no timeout).
pub trait EncodingHost: Send + Sync {
    fn request_encoding(&self) -> anyhow::Result<String>;
}

/// Host channel over a Unix domain socket: send the line `encoding`, read one
/// line back carrying the chosen encoding name.
pub struct SocketEncodingHost {
    socket_path: PathBuf,
}

impl SocketEncodingHost {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl EncodingHost for SocketEncodingHost {
    fn request_encoding(&self) -> anyhow::Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.write_all(b"encoding\n")?;
        stream.flush()?;

        let mut chosen = String::new();
        BufReader::new(stream).read_line(&mut chosen)?;
        Ok(chosen.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Two-stage encoding resolution: statistical detection first, interactive
/// host fallback second.
pub struct EncodingResolver {
    host: Box<dyn EncodingHost>,
}

impl EncodingResolver {
    pub fn new(host: Box<dyn EncodingHost>) -> Self {
        Self { host }
    }

    /// Resolve an encoding name for `bytes`.
    ///
    /// The returned name is not guaranteed to be one the decoder supports,
    /// validating that is the caller's job.
    pub fn detect(&self, bytes: &[u8]) -> Result<String, Error> {
        let (candidate, confidence, _) = chardet::detect(bytes);
        debug!(
            target: "encoding",
            "detected candidate \"{candidate}\" with confidence {confidence:.2}"
        );

        if confidence > CONFIDENCE_THRESHOLD && !candidate.is_empty() {
            return Ok(candidate);
        }

        info!(
            target: "encoding",
            "detection is not confident enough, asking the host for a choice"
        );
        let chosen = self
            .host
            .request_encoding()
            .map_err(Error::EncodingChoice)?;
        debug!(target: "encoding", "host chose \"{chosen}\"");
        Ok(chosen)
    }
}

/// Decode `bytes` with the encoding named by `label`. An unknown label is a
/// hard failure, never coerced to a default.
pub fn decode_bytes(bytes: &[u8], label: &str) -> Result<String, Error> {
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| Error::UnsupportedEncoding(label.to_string()))?;
    let (text, _, _) = encoding.decode(bytes);
    Ok(text.into_owned())
}
