use crate::{
    Error, MAX_BODY_SIZE, MAX_HEAD_SIZE,
    frame::{Frame, FrameKind, Headers},
};

use bytes::{Buf, Bytes, BytesMut};

/// Incremental frame parser.
///
/// Bytes are appended as they arrive from the transport; complete frames are
/// taken off the front. Whatever has not been consumed by a complete frame
/// stays buffered, so a connection that upgrades to TLS right after an
/// answer can hand the unread remainder to the handshake.
///
/// # Test
///
/// ```
/// use q2q_server_codec::FrameReader;
///
/// let mut reader = FrameReader::default();
/// reader.extend_from_slice(b"-Command: source-ip\r\n-As");
/// assert!(reader.next_frame().unwrap().is_none());
///
/// reader.extend_from_slice(b"k: 7\r\n\r\n");
/// let frame = reader.next_frame().unwrap().unwrap();
/// assert_eq!(frame.command(), Some("source-ip"));
/// assert_eq!(frame.tag(), Some(7));
/// ```
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The internal buffer, for reading from a socket without copying twice.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Surrender every unconsumed byte, leaving the reader empty.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Try to take one complete frame off the front of the buffer.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let head_end = match find_terminator(&self.buf) {
            Some(at) => at,
            None if self.buf.len() > MAX_HEAD_SIZE => return Err(Error::HeadTooLarge),
            None => return Ok(None),
        };

        let head = Head::parse(&self.buf[..head_end])?;
        if head.content_length > MAX_BODY_SIZE {
            return Err(Error::BodyTooLarge(head.content_length));
        }

        let total = head_end + 4 + head.content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = Frame {
            kind: head.kind,
            headers: head.headers,
            lists: head.lists,
            body: Bytes::new(),
            starts_tls: false,
        };

        let mut chunk = self.buf.split_to(total);
        chunk.advance(head_end + 4);

        Ok(Some(Frame {
            body: chunk.freeze(),
            ..frame
        }))
    }
}

/// Find the empty line ending the header section, returning the offset of
/// its leading CRLF.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|win| win == b"\r\n\r\n")
}

struct Head {
    kind: FrameKind,
    headers: Headers,
    lists: Vec<(String, Vec<Headers>)>,
    content_length: usize,
}

impl Head {
    fn parse(head: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::MalformedLine("not utf-8".to_string()))?;

        let mut command = None;
        let mut ask = None;
        let mut answer = None;
        let mut error = None;
        let mut error_code = None;
        let mut error_description = None;
        let mut fatal = false;
        let mut content_length = 0usize;

        let mut headers = Headers::new();
        let mut lists: Vec<(String, Vec<Headers>)> = Vec::new();
        let mut in_list = false;

        for line in text.split("\r\n") {
            if let Some(rest) = line.strip_prefix(' ') {
                // Indented lines belong to the most recently opened list.
                if !in_list {
                    return Err(Error::MalformedLine(line.to_string()));
                }

                let boxes = &mut lists.last_mut().unwrap().1;
                if rest.is_empty() {
                    boxes.push(Headers::new());
                } else {
                    let (key, value) = split_line(rest)?;
                    boxes.last_mut().unwrap().push(key, value);
                }

                continue;
            }

            // A bare `Name:` opens a nested box list; `Key: ` (colon and
            // space) is an ordinary header with an empty value.
            if !line.is_empty()
                && line.find(':') == Some(line.len() - 1)
                && !line.starts_with('-')
            {
                lists.push((line[..line.len() - 1].to_string(), vec![Headers::new()]));
                in_list = true;
                continue;
            }

            let (key, value) = split_line(line)?;

            in_list = false;
            match () {
                _ if key.eq_ignore_ascii_case("-Command") => command = Some(value),
                _ if key.eq_ignore_ascii_case("-Ask") => ask = Some(parse_tag(&value)?),
                _ if key.eq_ignore_ascii_case("-Answer") => answer = Some(parse_tag(&value)?),
                _ if key.eq_ignore_ascii_case("-Error") => error = Some(parse_tag(&value)?),
                _ if key.eq_ignore_ascii_case("-Error-Code") => error_code = Some(value),
                _ if key.eq_ignore_ascii_case("-Error-Description") => {
                    error_description = Some(value)
                }
                _ if key.eq_ignore_ascii_case("-Fatal") => fatal = value == "yes",
                _ if key.eq_ignore_ascii_case("-Content-Length") => {
                    content_length = value
                        .parse()
                        .map_err(|_| Error::MalformedLine(line.to_string()))?
                }
                _ => headers.push(key, value),
            }
        }

        let kind = match (command, answer, error) {
            (Some(command), None, None) => FrameKind::Request { command, tag: ask },
            (None, Some(tag), None) => FrameKind::Answer { tag },
            (None, None, Some(tag)) => FrameKind::Error {
                tag,
                code: error_code.unwrap_or_else(|| "ConnectionError".to_string()),
                description: error_description.unwrap_or_default(),
                fatal,
            },
            (None, None, None) => return Err(Error::MissingKind),
            _ => return Err(Error::AmbiguousKind),
        };

        // Empty trailing boxes appear when a list header closes the section.
        for (_, boxes) in &mut lists {
            boxes.retain(|nested| !nested.is_empty());
        }

        Ok(Self {
            kind,
            headers,
            lists,
            content_length,
        })
    }
}

fn split_line(line: &str) -> Result<(String, String), Error> {
    let at = line
        .find(':')
        .ok_or_else(|| Error::MalformedLine(line.to_string()))?;

    let key = &line[..at];
    if key.is_empty() || key.starts_with(' ') {
        return Err(Error::IllegalKey(key.to_string()));
    }

    let value = line[at + 1..].strip_prefix(' ').unwrap_or(&line[at + 1..]);
    Ok((key.to_string(), value.to_string()))
}

fn parse_tag(value: &str) -> Result<u64, Error> {
    value.parse().map_err(|_| Error::BadTag(value.to_string()))
}
