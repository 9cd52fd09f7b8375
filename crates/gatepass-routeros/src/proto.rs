//! Wire framing for the RouterOS binary API.
//!
//! A **word** is a length-prefixed byte string. A **sentence** is a run
//! of words terminated by a zero-length word. The length prefix is
//! variable-width, 1 to 5 bytes:
//!
//! | length         | encoding                        |
//! |----------------|---------------------------------|
//! | `< 0x80`       | 1 byte, the length itself       |
//! | `<= 0x3FFF`    | 2 bytes, high bits `10`         |
//! | `<= 0x1F_FFFF` | 3 bytes, high bits `110`        |
//! | `<= 0xFFF_FFFF`| 4 bytes, high bits `1110`       |
//! | otherwise      | `0xF0` marker, then u32 BE      |
//!
//! Requests put the command path first (`/ip/hotspot/user/add`), then
//! `=key=value` attribute words and `?key=value` query words. Replies
//! open with a category word: `!re` (row), `!done` (end), `!trap`
//! (command error) or `!fatal` (connection is going away).

use bytes::{BufMut, BytesMut};
use indexmap::IndexMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Hard cap on a single word. Hotspot tables are tiny; anything larger
/// means the length prefix was misread.
const MAX_WORD_LEN: u32 = 4 * 1024 * 1024;

// ── Encoding ─────────────────────────────────────────────────────────

/// Append the variable-width length prefix for `len`.
pub fn put_length(buf: &mut BytesMut, len: u32) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len <= 0x3FFF {
        buf.put_u16((len as u16) | 0x8000);
    } else if len <= 0x001F_FFFF {
        let v = len | 0x00C0_0000;
        buf.put_u8((v >> 16) as u8);
        buf.put_u16((v & 0xFFFF) as u16);
    } else if len <= 0x0FFF_FFFF {
        buf.put_u32(len | 0xE000_0000);
    } else {
        buf.put_u8(0xF0);
        buf.put_u32(len);
    }
}

/// Append one length-prefixed word.
pub fn put_word(buf: &mut BytesMut, word: &str) {
    put_length(buf, word.len() as u32);
    buf.put_slice(word.as_bytes());
}

/// Encode a full sentence: every word, then the empty terminator.
pub fn encode_sentence<W: AsRef<str>>(words: &[W]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    for word in words {
        put_word(&mut buf, word.as_ref());
    }
    buf.put_u8(0);
    buf
}

/// Write one sentence and flush.
pub async fn write_sentence<S, W>(stream: &mut S, words: &[W]) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
    W: AsRef<str>,
{
    let buf = encode_sentence(words);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Decode one length prefix.
pub async fn read_length<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u32, Error> {
    let first = stream.read_u8().await?;
    let len = if first & 0x80 == 0 {
        u32::from(first)
    } else if first & 0xC0 == 0x80 {
        let b = stream.read_u8().await?;
        (u32::from(first & 0x3F) << 8) | u32::from(b)
    } else if first & 0xE0 == 0xC0 {
        let b1 = stream.read_u8().await?;
        let b2 = stream.read_u8().await?;
        (u32::from(first & 0x1F) << 16) | (u32::from(b1) << 8) | u32::from(b2)
    } else if first & 0xF0 == 0xE0 {
        let b1 = stream.read_u8().await?;
        let b2 = stream.read_u8().await?;
        let b3 = stream.read_u8().await?;
        (u32::from(first & 0x0F) << 24)
            | (u32::from(b1) << 16)
            | (u32::from(b2) << 8)
            | u32::from(b3)
    } else if first == 0xF0 {
        stream.read_u32().await?
    } else {
        // 0xF1..=0xFF are reserved control bytes.
        return Err(Error::Protocol(format!(
            "reserved length control byte {first:#04x}"
        )));
    };

    if len > MAX_WORD_LEN {
        return Err(Error::Protocol(format!(
            "word length {len} exceeds maximum"
        )));
    }
    Ok(len)
}

/// Read one word. `None` marks the end of a sentence.
///
/// Values are ASCII in practice; anything else decodes lossily.
pub async fn read_word<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<String>, Error> {
    let len = read_length(stream).await?;
    if len == 0 {
        return Ok(None);
    }
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    Ok(Some(String::from_utf8_lossy(&data).into_owned()))
}

/// Read a full sentence (until the empty terminator word).
pub async fn read_sentence<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<String>, Error> {
    let mut words = Vec::new();
    while let Some(word) = read_word(stream).await? {
        words.push(word);
    }
    Ok(words)
}

// ── Replies ──────────────────────────────────────────────────────────

/// Reply category word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `!re` -- one result row.
    Data,
    /// `!done` -- end of command, may carry `=ret=` values.
    Done,
    /// `!trap` -- the command failed; the connection stays usable.
    Trap,
    /// `!fatal` -- the appliance is dropping the connection.
    Fatal,
}

impl ReplyKind {
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "!re" => Some(Self::Data),
            "!done" => Some(Self::Done),
            "!trap" => Some(Self::Trap),
            "!fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// One parsed reply sentence.
#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: ReplyKind,
    /// `=key=value` attribute words, in wire order.
    pub attributes: IndexMap<String, String>,
    /// Unprefixed words. `!fatal` carries its reason this way.
    pub plain: Vec<String>,
}

impl Reply {
    /// Parse a raw sentence. The first word must be a reply category.
    pub fn parse(words: Vec<String>) -> Result<Self, Error> {
        let mut iter = words.into_iter();
        let head = iter
            .next()
            .ok_or_else(|| Error::Protocol("empty reply sentence".into()))?;
        let kind = ReplyKind::parse(&head)
            .ok_or_else(|| Error::Protocol(format!("unknown reply category '{head}'")))?;

        let mut attributes = IndexMap::new();
        let mut plain = Vec::new();
        for word in iter {
            if let Some(rest) = word.strip_prefix('=') {
                match rest.split_once('=') {
                    Some((key, value)) => {
                        attributes.insert(key.to_owned(), value.to_owned());
                    }
                    None => {
                        attributes.insert(rest.to_owned(), String::new());
                    }
                }
            } else {
                plain.push(word);
            }
        }
        Ok(Self {
            kind,
            attributes,
            plain,
        })
    }

    /// The `=message=` attribute, where traps put their reason.
    pub fn message(&self) -> Option<&str> {
        self.attributes.get("message").map(String::as_str)
    }
}
