//! Line-delimited records exchanged by sessions.
//!
//! Every record is one line:
//!
//! ```text
//! senderAddress:appName:command:mode:payload\n
//! ```
//!
//! `mode` is `p` (plain, only for the system app during handshake) or `e`
//! (encrypted). Encrypted payloads are `base64(ciphertext).base64(signature)`;
//! the handshake payload is `base64(JSON(advertisement))`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};
use crate::identity::Address;

/// Reserved app name for protocol-level records.
pub const SYSTEM_APP: &str = "";

/// Command carried by handshake records.
pub const HANDSHAKE_COMMAND: &str = "h";

/// Longest record accepted by [`LineFramer`], excluding the newline.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Record payload mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    Encrypted,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "p",
            Self::Encrypted => "e",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "p" => Ok(Self::Plain),
            "e" => Ok(Self::Encrypted),
            other => Err(NetworkError::Protocol(format!("Unknown mode: {other:?}"))),
        }
    }
}

/// One wire record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sender: String,
    pub app: String,
    pub command: String,
    pub mode: Mode,
    pub payload: String,
}

impl Record {
    /// A plain-mode handshake record.
    pub fn handshake(sender: &Address, advertisement: &Advertisement) -> Result<Self> {
        Ok(Self {
            sender: sender.to_string(),
            app: SYSTEM_APP.to_string(),
            command: HANDSHAKE_COMMAND.to_string(),
            mode: Mode::Plain,
            payload: advertisement.encode()?,
        })
    }

    /// An encrypted-mode record carrying a sealed payload.
    pub fn encrypted(
        sender: &Address,
        app: &str,
        command: &str,
        ciphertext: &[u8],
        signature: &[u8],
    ) -> Self {
        Self {
            sender: sender.to_string(),
            app: app.to_string(),
            command: command.to_string(),
            mode: Mode::Encrypted,
            payload: seal(ciphertext, signature),
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.mode == Mode::Plain && self.app == SYSTEM_APP && self.command == HANDSHAKE_COMMAND
    }

    /// Encode as a newline-terminated line.
    pub fn encode(&self) -> Result<String> {
        for (field, value) in [
            ("sender", &self.sender),
            ("app", &self.app),
            ("command", &self.command),
            ("payload", &self.payload),
        ] {
            if value.contains(':') || value.contains('\n') {
                return Err(NetworkError::Protocol(format!(
                    "Record {field} must not contain ':' or newline: {value:?}"
                )));
            }
        }
        Ok(format!(
            "{}:{}:{}:{}:{}\n",
            self.sender,
            self.app,
            self.command,
            self.mode.as_str(),
            self.payload
        ))
    }

    /// Parse a single line (with or without its trailing newline).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let parts: Vec<&str> = line.splitn(5, ':').collect();
        let [sender, app, command, mode, payload] = parts.as_slice() else {
            return Err(NetworkError::Protocol(format!(
                "Expected 5 fields, got {}",
                parts.len()
            )));
        };

        Ok(Self {
            sender: sender.to_string(),
            app: app.to_string(),
            command: command.to_string(),
            mode: Mode::parse(mode)?,
            payload: payload.to_string(),
        })
    }
}

/// Join ciphertext and signature into an encrypted payload.
pub fn seal(ciphertext: &[u8], signature: &[u8]) -> String {
    format!("{}.{}", STANDARD.encode(ciphertext), STANDARD.encode(signature))
}

/// Split an encrypted payload into `(ciphertext, signature)`.
pub fn open(payload: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let (ciphertext, signature) = payload
        .split_once('.')
        .ok_or_else(|| NetworkError::Protocol("Encrypted payload has no signature".into()))?;
    if signature.contains('.') {
        return Err(NetworkError::Protocol("Encrypted payload has extra fields".into()));
    }
    let decode = |chunk: &str| {
        STANDARD
            .decode(chunk)
            .map_err(|e| NetworkError::Protocol(format!("Bad base64: {e}")))
    };
    Ok((decode(ciphertext)?, decode(signature)?))
}

/// What a node announces about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub address: Address,
    pub public_key: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
}

impl Advertisement {
    /// `base64(JSON(self))`.
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let json = STANDARD
            .decode(payload)
            .map_err(|e| NetworkError::Protocol(format!("Bad handshake encoding: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Reassembles newline-delimited records from arbitrary read chunks.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from one read; returns every completed line, in order,
    /// without the trailing newline.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        let mut start = self.buf.len();
        self.buf.extend_from_slice(bytes);

        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            lines.push(line);
            start = 0;
        }

        if self.buf.len() > MAX_RECORD_LEN {
            self.buf.clear();
            return Err(NetworkError::Protocol(format!(
                "Record exceeds {MAX_RECORD_LEN} bytes"
            )));
        }
        Ok(lines)
    }

    /// Bytes of an incomplete trailing record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
