use anyhow::Result;
use bytes::BytesMut;
use q2q_server_codec::{Frame, FrameKind, FrameReader, Headers};

fn roundtrip(frame: &Frame) -> Result<Frame> {
    let mut wire = BytesMut::new();
    frame.encode(&mut wire)?;

    let mut reader = FrameReader::default();
    reader.extend_from_slice(&wire);

    let parsed = reader.next_frame()?.expect("complete frame");
    assert!(reader.take_remaining().is_empty());
    Ok(parsed)
}

#[test]
fn request_with_headers_and_body() -> Result<()> {
    let mut frame = Frame::request("write")
        .with_header("Id", "alice@example.com->bob@other.org:1")
        .with_body("HELLO WORLD".into());
    frame.set_tag(42);

    let parsed = roundtrip(&frame)?;
    assert_eq!(parsed.command(), Some("write"));
    assert_eq!(parsed.tag(), Some(42));
    assert_eq!(
        parsed.headers.get("id"),
        Some("alice@example.com->bob@other.org:1")
    );
    assert_eq!(&parsed.body[..], b"HELLO WORLD");
    Ok(())
}

#[test]
fn error_frame_carries_code_and_fatality() -> Result<()> {
    let frame = Frame::error(9, "VerifyError", "certificate name mismatch", true);
    let parsed = roundtrip(&frame)?;

    match parsed.kind {
        FrameKind::Error {
            tag,
            code,
            description,
            fatal,
        } => {
            assert_eq!(tag, 9);
            assert_eq!(code, "VerifyError");
            assert_eq!(description, "certificate name mismatch");
            assert!(fatal);
        }
        other => panic!("wrong kind: {:?}", other),
    }

    Ok(())
}

#[test]
fn nested_listener_boxes() -> Result<()> {
    let mut lab = Headers::new();
    lab.set("Id", "a->b:1");
    lab.set("Methods", "tcp@18.38.12.4:3827, virtual");
    lab.set("Description", "at lab");

    let mut home = Headers::new();
    home.set("Id", "a->b:2");
    home.set("Methods", "virtual");
    home.set("Description", "my home machine");

    let mut frame = Frame::answer(3);
    frame.lists.push(("Listeners".to_string(), vec![lab, home]));

    let parsed = roundtrip(&frame)?;
    let listeners = parsed.list("listeners").expect("list present");
    assert_eq!(listeners.len(), 2);
    assert_eq!(listeners[0].get("Description"), Some("at lab"));
    assert_eq!(
        listeners[0].get("Methods"),
        Some("tcp@18.38.12.4:3827, virtual")
    );
    assert_eq!(listeners[1].get("Id"), Some("a->b:2"));
    Ok(())
}

#[test]
fn empty_listener_list_parses_empty() -> Result<()> {
    let mut frame = Frame::answer(4);
    frame.lists.push(("Listeners".to_string(), Vec::new()));

    let parsed = roundtrip(&frame)?;
    assert_eq!(parsed.list("Listeners"), Some(&[][..]));
    Ok(())
}

#[test]
fn frames_arrive_in_pieces_and_back_to_back() -> Result<()> {
    let mut first = Frame::request("source-ip");
    first.set_tag(1);
    let second = Frame::answer(1).with_header("Ip", "4.3.2.1");

    let mut wire = BytesMut::new();
    first.encode(&mut wire)?;
    second.encode(&mut wire)?;

    let mut reader = FrameReader::default();
    for chunk in wire.chunks(5) {
        reader.extend_from_slice(chunk);
    }

    let a = reader.next_frame()?.expect("first frame");
    let b = reader.next_frame()?.expect("second frame");
    assert_eq!(a.command(), Some("source-ip"));
    assert_eq!(b.headers.get("Ip"), Some("4.3.2.1"));
    assert!(reader.next_frame()?.is_none());
    Ok(())
}

#[test]
fn unconsumed_bytes_can_be_taken_back() -> Result<()> {
    let mut frame = Frame::answer(1);
    frame.starts_tls = true;

    let mut wire = BytesMut::new();
    frame.encode(&mut wire)?;
    wire.extend_from_slice(b"\x16\x03\x01 pretend handshake");

    let mut reader = FrameReader::default();
    reader.extend_from_slice(&wire);
    reader.next_frame()?.expect("answer");

    assert_eq!(&reader.take_remaining()[..], b"\x16\x03\x01 pretend handshake");
    Ok(())
}

#[test]
fn empty_header_values_stay_headers() -> Result<()> {
    let frame = Frame::request("listen").with_header("Description", "");
    let parsed = roundtrip(&frame)?;

    assert_eq!(parsed.headers.get("Description"), Some(""));
    assert!(parsed.lists.is_empty());
    Ok(())
}

#[test]
fn values_may_not_contain_line_breaks() {
    let frame = Frame::request("listen").with_header("Description", "two\r\nlines");
    let mut wire = BytesMut::new();
    assert!(frame.encode(&mut wire).is_err());
}
