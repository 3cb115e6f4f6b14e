use crate::{Error, MAX_BODY_SIZE};

use bytes::{BufMut, Bytes, BytesMut};

/// What a frame is: a command, an acknowledgement, or an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Request {
        command: String,
        /// Present when the sender wants a correlated response.
        tag: Option<u64>,
    },
    Answer {
        tag: u64,
    },
    Error {
        tag: u64,
        code: String,
        description: String,
        /// Fatal errors terminate the connection once transmitted.
        fatal: bool,
    },
}

/// An ordered list of `Key: value` pairs. Lookup is case-insensitive,
/// emission preserves the key as it was set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value under the same key.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if let Some(slot) = self
            .0
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            slot.1 = value;
        } else {
            self.0.push((key.to_string(), value));
        }

        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, key: String, value: String) {
        self.0.push((key, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single frame.
///
/// `starts_tls` never reaches the wire: it tells the connection that owns the
/// transport to negotiate TLS immediately after this frame is flushed (on the
/// answering side) or once the matching answer has been read (on the asking
/// side).
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub headers: Headers,
    /// Nested box lists, e.g. the `Listeners` of an inbound reply.
    pub lists: Vec<(String, Vec<Headers>)>,
    pub body: Bytes,
    pub starts_tls: bool,
}

impl Frame {
    pub fn request(command: &str) -> Self {
        Self {
            kind: FrameKind::Request {
                command: command.to_string(),
                tag: None,
            },
            headers: Headers::new(),
            lists: Vec::new(),
            body: Bytes::new(),
            starts_tls: false,
        }
    }

    pub fn answer(tag: u64) -> Self {
        Self {
            kind: FrameKind::Answer { tag },
            headers: Headers::new(),
            lists: Vec::new(),
            body: Bytes::new(),
            starts_tls: false,
        }
    }

    pub fn error(tag: u64, code: &str, description: &str, fatal: bool) -> Self {
        Self {
            kind: FrameKind::Error {
                tag,
                code: code.to_string(),
                description: description.to_string(),
                fatal,
            },
            headers: Headers::new(),
            lists: Vec::new(),
            body: Bytes::new(),
            starts_tls: false,
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            FrameKind::Request { command, .. } => Some(command.as_str()),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<u64> {
        match &self.kind {
            FrameKind::Request { tag, .. } => *tag,
            FrameKind::Answer { tag } => Some(*tag),
            FrameKind::Error { tag, .. } => Some(*tag),
        }
    }

    pub fn set_tag(&mut self, value: u64) {
        if let FrameKind::Request { tag, .. } = &mut self.kind {
            *tag = Some(value);
        }
    }

    pub fn list(&self, name: &str) -> Option<&[Headers]> {
        self.lists
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, boxes)| boxes.as_slice())
    }

    /// Serialize this frame onto `dst`.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use q2q_server_codec::Frame;
    ///
    /// let mut frame = Frame::request("source-ip");
    /// frame.set_tag(1);
    ///
    /// let mut dst = BytesMut::new();
    /// frame.encode(&mut dst).unwrap();
    ///
    /// assert_eq!(&dst[..], b"-Command: source-ip\r\n-Ask: 1\r\n\r\n");
    /// ```
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(Error::BodyTooLarge(self.body.len()));
        }

        match &self.kind {
            FrameKind::Request { command, tag } => {
                check_value(command)?;
                put_line(dst, "-Command", command);
                if let Some(tag) = tag {
                    put_line(dst, "-Ask", &tag.to_string());
                }
            }
            FrameKind::Answer { tag } => {
                put_line(dst, "-Answer", &tag.to_string());
            }
            FrameKind::Error {
                tag,
                code,
                description,
                fatal,
            } => {
                check_value(code)?;
                put_line(dst, "-Error", &tag.to_string());
                put_line(dst, "-Error-Code", code);
                put_line(dst, "-Error-Description", &flatten(description));
                if *fatal {
                    put_line(dst, "-Fatal", "yes");
                }
            }
        }

        for (key, value) in self.headers.iter() {
            check_key(key)?;
            check_value(value)?;
            put_line(dst, key, value);
        }

        for (name, boxes) in &self.lists {
            check_key(name)?;
            dst.put_slice(name.as_bytes());
            dst.put_slice(b":\r\n");
            for (index, nested) in boxes.iter().enumerate() {
                if index > 0 {
                    dst.put_slice(b" \r\n");
                }

                for (key, value) in nested.iter() {
                    check_key(key)?;
                    check_value(value)?;
                    dst.put_slice(b" ");
                    put_line(dst, key, value);
                }
            }
        }

        if !self.body.is_empty() {
            put_line(dst, "-Content-Length", &self.body.len().to_string());
        }

        dst.put_slice(b"\r\n");
        dst.put_slice(&self.body);
        Ok(())
    }
}

fn put_line(dst: &mut BytesMut, key: &str, value: &str) {
    dst.put_slice(key.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(b"\r\n");
}

fn check_key(key: &str) -> Result<(), Error> {
    if key.is_empty()
        || key.starts_with(' ')
        || key.contains(':')
        || key.contains('\r')
        || key.contains('\n')
    {
        return Err(Error::IllegalKey(key.to_string()));
    }

    Ok(())
}

fn check_value(value: &str) -> Result<(), Error> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::IllegalValue(value.to_string()));
    }

    Ok(())
}

/// Collapse line breaks so any text is safe as an error description.
fn flatten(text: &str) -> String {
    if text.contains('\r') || text.contains('\n') {
        text.replace(['\r', '\n'], " ")
    } else {
        text.to_string()
    }
}
